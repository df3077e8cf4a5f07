use p256::SecretKey;
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::oauth::dpop::{
    authserver_proof, client_assertion_jwt, nonce_opt, send_with_nonce_retry,
    wants_authserver_nonce, DpopResponse,
};
use crate::oauth::jwk;
use crate::oauth::metadata::fetch_authserver_meta;
use crate::oauth::par::CLIENT_ASSERTION_TYPE;
use crate::oauth::store::{OAuthSession, PendingAuthRequest};
use crate::security::SafeUrlGuard;

/// Successful token endpoint response, for both grant types.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// The account DID the tokens are for.
    pub sub: String,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Client identity needed to authenticate against the token endpoint.
pub struct ClientAuth<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub key: &'a SecretKey,
    pub kid: &'a str,
}

async fn token_grant(
    http: &reqwest::Client,
    guard: &SafeUrlGuard,
    authserver_url: &str,
    form: Vec<(&str, &str)>,
    dpop_key: &SecretKey,
    stored_nonce: &str,
) -> Result<(DpopResponse, String)> {
    // Metadata is re-fetched and re-validated on every grant; a server that
    // has since rotated to a non-conforming config fails closed here.
    let meta = fetch_authserver_meta(http, guard, authserver_url).await?;
    let token_url = meta.token_endpoint.clone();
    guard.ensure_safe(&token_url).await?;

    let (resp, nonce) = send_with_nonce_retry(
        |nonce| {
            let proof = authserver_proof("POST", &token_url, nonce, dpop_key)?;
            Ok(http.post(&token_url).header("DPoP", proof).form(&form))
        },
        nonce_opt(stored_nonce),
        wants_authserver_nonce,
    )
    .await?;

    Ok((resp, nonce.unwrap_or_default()))
}

/// Exchange the callback authorization code for tokens, reusing the DPoP key
/// and nonce minted for this login attempt.
///
/// The caller still has to verify `sub` and `scope` against what the flow
/// started with.
pub async fn initial_token_request(
    http: &reqwest::Client,
    guard: &SafeUrlGuard,
    pending: &PendingAuthRequest,
    code: &str,
    auth: &ClientAuth<'_>,
) -> Result<(TokenResponse, String)> {
    let client_assertion = client_assertion_jwt(
        auth.client_id,
        &pending.authserver_issuer,
        auth.key,
        auth.kid,
    )?;
    let dpop_key = jwk::key_from_pem(&pending.dpop_private_key)?;

    let form: Vec<(&str, &str)> = vec![
        ("client_id", auth.client_id),
        ("redirect_uri", auth.redirect_uri),
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", &pending.pkce_verifier),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE),
        ("client_assertion", &client_assertion),
    ];

    let (resp, nonce) = token_grant(
        http,
        guard,
        &pending.authserver_issuer,
        form,
        &dpop_key,
        &pending.dpop_authserver_nonce,
    )
    .await?;

    if !resp.status.is_success() {
        return Err(Error::TokenRequest(format!(
            "authserver returned {}: {}",
            resp.status,
            resp.error_field().unwrap_or_default()
        )));
    }

    let body: TokenResponse = resp
        .json()
        .map_err(|_| Error::TokenRequest("response body did not parse".to_string()))?;
    info!(sub = %body.sub, "authorization code exchanged");

    Ok((body, nonce))
}

/// Trade the session's refresh token for a new token pair. The refreshed
/// session keeps its old refresh token when the server omits one.
pub async fn refresh_token_request(
    http: &reqwest::Client,
    guard: &SafeUrlGuard,
    session: &OAuthSession,
    auth: &ClientAuth<'_>,
) -> Result<(TokenResponse, String)> {
    let client_assertion = client_assertion_jwt(
        auth.client_id,
        &session.authserver_issuer,
        auth.key,
        auth.kid,
    )?;
    let dpop_key = jwk::key_from_pem(&session.dpop_private_key)?;

    let form: Vec<(&str, &str)> = vec![
        ("client_id", auth.client_id),
        ("grant_type", "refresh_token"),
        ("refresh_token", &session.refresh_token),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE),
        ("client_assertion", &client_assertion),
    ];

    let (resp, nonce) = token_grant(
        http,
        guard,
        &session.authserver_issuer,
        form,
        &dpop_key,
        &session.dpop_authserver_nonce,
    )
    .await?;

    if !resp.status.is_success() {
        warn!(status = %resp.status, did = %session.did, "token refresh rejected");
        return Err(Error::Refresh(format!(
            "authserver returned {}: {}",
            resp.status,
            resp.error_field().unwrap_or_default()
        )));
    }

    let mut body: TokenResponse = resp
        .json()
        .map_err(|_| Error::Refresh("response body did not parse".to_string()))?;
    if body.refresh_token.is_none() {
        body.refresh_token = Some(session.refresh_token.clone());
    }
    info!(did = %session.did, "session tokens refreshed");

    Ok((body, nonce))
}
