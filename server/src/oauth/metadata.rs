use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::security::{is_loopback_host, SafeUrlGuard};

/// Authorization Server metadata document, per RFC 8414 plus the atproto
/// OAuth profile fields we validate.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub pushed_authorization_request_endpoint: Option<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub authorization_response_iss_parameter_supported: bool,
    #[serde(default)]
    pub require_pushed_authorization_requests: bool,
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub require_request_uri_registration: Option<bool>,
    #[serde(default)]
    pub client_id_metadata_document_supported: bool,
}

#[derive(Debug, Deserialize)]
struct ProtectedResource {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

fn invalid(reason: &str) -> Error {
    Error::InvalidAuthServerMetadata(reason.to_string())
}

/// Check every atproto OAuth requirement on an Authorization Server metadata
/// document fetched from `fetch_url`. A server failing any one of these is
/// unusable for login, so the first failure wins.
pub fn validate_authserver_meta(
    meta: &AuthServerMetadata,
    fetch_url: &str,
    allow_loopback: bool,
) -> Result<()> {
    let fetched = Url::parse(fetch_url)
        .map_err(|_| invalid("authserver URL did not parse"))?;
    let issuer = Url::parse(&meta.issuer)
        .map_err(|_| invalid("issuer is not a valid URL"))?;

    if issuer.host_str() != fetched.host_str() {
        return Err(invalid("issuer host does not match fetch host"));
    }
    let loopback_dev = allow_loopback
        && issuer.host_str().map(is_loopback_host).unwrap_or(false);
    if !loopback_dev {
        if issuer.scheme() != "https" {
            return Err(invalid("issuer must use https"));
        }
        if issuer.port().is_some() {
            return Err(invalid("issuer must not carry an explicit port"));
        }
    }
    if !matches!(issuer.path(), "" | "/") {
        return Err(invalid("issuer must not have a path"));
    }
    if issuer.query().is_some() || issuer.fragment().is_some() {
        return Err(invalid("issuer must not have a query or fragment"));
    }

    let contains = |list: &[String], want: &str| list.iter().any(|v| v == want);

    if !contains(&meta.response_types_supported, "code") {
        return Err(invalid("response_types_supported must include code"));
    }
    if !contains(&meta.grant_types_supported, "authorization_code") {
        return Err(invalid(
            "grant_types_supported must include authorization_code",
        ));
    }
    if !contains(&meta.grant_types_supported, "refresh_token") {
        return Err(invalid("grant_types_supported must include refresh_token"));
    }
    if !contains(&meta.code_challenge_methods_supported, "S256") {
        return Err(invalid(
            "code_challenge_methods_supported must include S256",
        ));
    }
    if !contains(&meta.token_endpoint_auth_methods_supported, "none") {
        return Err(invalid(
            "token_endpoint_auth_methods_supported must include none",
        ));
    }
    if !contains(
        &meta.token_endpoint_auth_methods_supported,
        "private_key_jwt",
    ) {
        return Err(invalid(
            "token_endpoint_auth_methods_supported must include private_key_jwt",
        ));
    }
    if !contains(
        &meta.token_endpoint_auth_signing_alg_values_supported,
        "ES256",
    ) {
        return Err(invalid(
            "token_endpoint_auth_signing_alg_values_supported must include ES256",
        ));
    }
    if !contains(&meta.scopes_supported, "atproto") {
        return Err(invalid("scopes_supported must include atproto"));
    }
    if !meta.authorization_response_iss_parameter_supported {
        return Err(invalid(
            "authorization_response_iss_parameter_supported must be true",
        ));
    }
    match meta.pushed_authorization_request_endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => {}
        _ => {
            return Err(invalid(
                "pushed_authorization_request_endpoint is required",
            ))
        }
    }
    if !meta.require_pushed_authorization_requests {
        return Err(invalid(
            "require_pushed_authorization_requests must be true",
        ));
    }
    if !contains(&meta.dpop_signing_alg_values_supported, "ES256") {
        return Err(invalid(
            "dpop_signing_alg_values_supported must include ES256",
        ));
    }
    if meta.require_request_uri_registration == Some(false) {
        return Err(invalid(
            "require_request_uri_registration, when present, must be true",
        ));
    }
    if !meta.client_id_metadata_document_supported {
        return Err(invalid(
            "client_id_metadata_document_supported must be true",
        ));
    }

    Ok(())
}

/// Resolve a PDS origin to its Authorization Server origin via the protected
/// resource well-known document. The PDS URL comes from an untrusted DID
/// document, so it passes the SSRF guard before we touch it.
pub async fn resolve_pds_authserver(
    http: &reqwest::Client,
    guard: &SafeUrlGuard,
    pds_url: &str,
) -> Result<String> {
    guard.ensure_safe(pds_url).await?;

    let url = format!(
        "{}/.well-known/oauth-protected-resource",
        pds_url.trim_end_matches('/')
    );
    let resp = http.get(&url).send().await?;
    if resp.status() != StatusCode::OK {
        return Err(invalid(&format!(
            "protected resource lookup returned {}",
            resp.status()
        )));
    }
    let doc: ProtectedResource = resp
        .json()
        .await
        .map_err(|_| invalid("protected resource document did not parse"))?;

    doc.authorization_servers
        .into_iter()
        .next()
        .ok_or_else(|| invalid("protected resource lists no authorization servers"))
}

/// Fetch and validate an Authorization Server's metadata document. The URL
/// may come from an untrusted protected-resource document.
pub async fn fetch_authserver_meta(
    http: &reqwest::Client,
    guard: &SafeUrlGuard,
    authserver_url: &str,
) -> Result<AuthServerMetadata> {
    guard.ensure_safe(authserver_url).await?;

    let url = format!(
        "{}/.well-known/oauth-authorization-server",
        authserver_url.trim_end_matches('/')
    );
    debug!(%url, "fetching authserver metadata");
    let resp = http.get(&url).send().await?;
    if resp.status() != StatusCode::OK {
        return Err(invalid(&format!(
            "authserver metadata lookup returned {}",
            resp.status()
        )));
    }
    let meta: AuthServerMetadata = resp
        .json()
        .await
        .map_err(|_| invalid("authserver metadata did not parse"))?;

    validate_authserver_meta(&meta, authserver_url, guard.allows_loopback())?;
    Ok(meta)
}
