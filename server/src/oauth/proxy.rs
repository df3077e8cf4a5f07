use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use tracing::info;

use crate::errors::{Error, Result};
use crate::oauth::dpop::{nonce_opt, resource_proof, DpopResponse};
use crate::oauth::jwk;
use crate::oauth::store::{OAuthSession, SessionStore};
use crate::oauth::token::{refresh_token_request, ClientAuth};
use crate::security::SafeUrlGuard;

fn is_expired_token(resp: &DpopResponse) -> bool {
    resp.status == reqwest::StatusCode::UNAUTHORIZED
        && String::from_utf8_lossy(&resp.body).contains("invalid_token")
}

async fn attempt(
    http: &reqwest::Client,
    method: &Method,
    url: &str,
    session: &OAuthSession,
    dpop_key: &p256::SecretKey,
    body: Option<&serde_json::Value>,
) -> Result<DpopResponse> {
    let proof = resource_proof(
        method.as_str(),
        url,
        &session.authserver_issuer,
        &session.access_token,
        nonce_opt(&session.dpop_pds_nonce).as_deref(),
        dpop_key,
    )?;

    let mut builder = match *method {
        Method::GET => http.get(url),
        Method::POST => http.post(url),
        ref other => {
            return Err(Error::TokenRequest(format!(
                "unsupported proxy method: {other}"
            )))
        }
    };
    if let Some(body) = body {
        builder = match *method {
            Method::GET => builder.query(body),
            _ => builder.json(body),
        };
    }
    let builder = builder
        .header(AUTHORIZATION, format!("DPoP {}", session.access_token))
        .header("DPoP", proof);

    DpopResponse::from_reqwest(builder.send().await?).await
}

/// Issue an authenticated XRPC request against the session owner's PDS.
///
/// At most two upstream attempts are made. A `401 invalid_token` first
/// answer triggers a token refresh (persisted before the retry); any other
/// failure carrying a `DPoP-Nonce` header retries once with that nonce, also
/// persisted first. Everything else is returned to the caller as-is, body
/// and status untouched.
pub async fn pds_authed_request(
    http: &reqwest::Client,
    guard: &SafeUrlGuard,
    store: &dyn SessionStore,
    auth: &ClientAuth<'_>,
    session: &OAuthSession,
    method: Method,
    url: &str,
    body: Option<&serde_json::Value>,
) -> Result<DpopResponse> {
    // The PDS endpoint originates from an untrusted DID document.
    guard.ensure_safe(url).await?;

    let mut session = session.clone();
    let dpop_key = jwk::key_from_pem(&session.dpop_private_key)?;

    let resp = attempt(http, &method, url, &session, &dpop_key, body).await?;
    if resp.status.is_success() {
        return Ok(resp);
    }

    if is_expired_token(&resp) {
        info!(did = %session.did, "access token expired, refreshing");
        let (tokens, authserver_nonce) =
            refresh_token_request(http, guard, &session, auth).await?;
        let refresh_token = tokens
            .refresh_token
            .unwrap_or_else(|| session.refresh_token.clone());
        store
            .update_session_tokens(
                &session.did,
                &tokens.access_token,
                &refresh_token,
                &authserver_nonce,
            )
            .await?;
        session.access_token = tokens.access_token;
        session.refresh_token = refresh_token;
        session.dpop_authserver_nonce = authserver_nonce;
        return attempt(http, &method, url, &session, &dpop_key, body).await;
    }

    if let Some(fresh) = resp.dpop_nonce() {
        info!(did = %session.did, "retrying with new PDS DPoP nonce");
        store.update_pds_nonce(&session.did, &fresh).await?;
        session.dpop_pds_nonce = fresh;
        return attempt(http, &method, url, &session, &dpop_key, body).await;
    }

    Ok(resp)
}
