use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use jsonwebtoken::{Algorithm, Header};
use p256::SecretKey;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::{Error, Result};
use crate::oauth::jwk;

/// Proof lifetime for authorization-server requests (PAR, token grants).
const AUTHSERVER_PROOF_TTL: u64 = 30;
/// Proof lifetime for resource-server (PDS) requests.
const RESOURCE_PROOF_TTL: u64 = 10;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Serialize)]
struct ProofClaims<'a> {
    jti: String,
    htm: &'a str,
    htu: &'a str,
    iat: u64,
    exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
}

fn build_proof(
    method: &str,
    url: &str,
    nonce: Option<&str>,
    key: &SecretKey,
    ttl: u64,
    iss: Option<&str>,
    access_token: Option<&str>,
) -> Result<String> {
    let mut header = Header::new(Algorithm::ES256);
    header.typ = Some("dpop+jwt".to_string());
    // Public components only; the private key never leaves the signer.
    header.jwk = Some(jwk::public_jwk(key)?);

    let now = now_unix();
    let claims = ProofClaims {
        jti: uuid::Uuid::new_v4().to_string(),
        htm: method,
        htu: url,
        iat: now,
        exp: now + ttl,
        nonce,
        iss,
        ath: access_token.map(|token| URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))),
    };

    Ok(jsonwebtoken::encode(
        &header,
        &claims,
        &jwk::encoding_key(key)?,
    )?)
}

/// DPoP proof for an Authorization Server request (PAR or token endpoint).
pub fn authserver_proof(
    method: &str,
    url: &str,
    nonce: Option<&str>,
    key: &SecretKey,
) -> Result<String> {
    build_proof(method, url, nonce, key, AUTHSERVER_PROOF_TTL, None, None)
}

/// DPoP proof for a Resource Server (PDS) request; carries `iss` and the
/// `ath` hash binding the proof to the access token.
pub fn resource_proof(
    method: &str,
    url: &str,
    iss: &str,
    access_token: &str,
    nonce: Option<&str>,
    key: &SecretKey,
) -> Result<String> {
    build_proof(
        method,
        url,
        nonce,
        key,
        RESOURCE_PROOF_TTL,
        Some(iss),
        Some(access_token),
    )
}

/// Claims for the self-signed client assertion sent to the Authorization
/// Server (confidential client, `private_key_jwt`).
#[derive(Debug, Serialize)]
struct ClientAssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    jti: String,
    iat: u64,
}

/// Self-signed ES256 JWT using the private key declared in the client
/// metadata JWKS.
pub fn client_assertion_jwt(
    client_id: &str,
    authserver_url: &str,
    key: &SecretKey,
    kid: &str,
) -> Result<String> {
    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(kid.to_string());

    let claims = ClientAssertionClaims {
        iss: client_id,
        sub: client_id,
        aud: authserver_url,
        jti: uuid::Uuid::new_v4().to_string(),
        iat: now_unix(),
    };

    Ok(jsonwebtoken::encode(
        &header,
        &claims,
        &jwk::encoding_key(key)?,
    )?)
}

/// A fully materialized upstream response: PAR, token, and proxy calls all
/// need to inspect the body without consuming anything.
#[derive(Debug)]
pub struct DpopResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DpopResponse {
    pub async fn from_reqwest(resp: reqwest::Response) -> Result<Self> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// The `DPoP-Nonce` response header, if the server supplied one.
    pub fn dpop_nonce(&self) -> Option<String> {
        self.headers
            .get("DPoP-Nonce")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// The OAuth `error` field of a JSON error body, if any.
    pub fn error_field(&self) -> Option<String> {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::TokenRequest(format!("failed to decode upstream response body: {e}"))
        })
    }
}

/// Does an Authorization Server error response demand a fresh DPoP nonce?
pub fn wants_authserver_nonce(resp: &DpopResponse) -> bool {
    resp.status == StatusCode::BAD_REQUEST
        && resp.error_field().as_deref() == Some("use_dpop_nonce")
}

/// Issue a DPoP-protected request built by `build`, retrying exactly once
/// with the server-provided `DPoP-Nonce` when `should_retry` says so.
///
/// The single-retry budget is enforced here for every call site; a server
/// that keeps demanding new nonces after the retry is a hard failure the
/// caller sees as a non-2xx response. Returns the response together with the
/// last nonce that was actually used.
pub async fn send_with_nonce_retry<F>(
    mut build: F,
    initial_nonce: Option<String>,
    should_retry: impl Fn(&DpopResponse) -> bool,
) -> Result<(DpopResponse, Option<String>)>
where
    F: FnMut(Option<&str>) -> Result<reqwest::RequestBuilder>,
{
    let request = build(initial_nonce.as_deref())?;
    let resp = DpopResponse::from_reqwest(request.send().await?).await?;

    if should_retry(&resp) {
        if let Some(fresh) = resp.dpop_nonce() {
            info!("retrying with new server DPoP nonce");
            let request = build(Some(&fresh))?;
            let resp = DpopResponse::from_reqwest(request.send().await?).await?;
            return Ok((resp, Some(fresh)));
        }
    }

    Ok((resp, initial_nonce))
}

/// Empty-string nonces from storage mean "none yet".
pub fn nonce_opt(stored: &str) -> Option<String> {
    if stored.is_empty() {
        None
    } else {
        Some(stored.to_string())
    }
}
