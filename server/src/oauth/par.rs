use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::SecretKey;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::{Error, Result};
use crate::oauth::dpop::{
    authserver_proof, client_assertion_jwt, send_with_nonce_retry, wants_authserver_nonce,
};
use crate::oauth::metadata::AuthServerMetadata;
use crate::security::SafeUrlGuard;

pub const CLIENT_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Random URL-safe token, `len` bytes of entropy before encoding.
pub fn generate_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for a PKCE verifier.
pub fn code_challenge_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub struct ParRequest<'a> {
    pub authserver_url: &'a str,
    pub meta: &'a AuthServerMetadata,
    /// Account hint for the authserver login page; absent when the user gave
    /// us the authserver URL directly.
    pub login_hint: Option<&'a str>,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: &'a str,
    pub client_key: &'a SecretKey,
    pub client_kid: &'a str,
    pub dpop_key: &'a SecretKey,
}

pub struct ParOutcome {
    pub state: String,
    pub pkce_verifier: String,
    /// Authserver DPoP nonce observed during the exchange, empty if none.
    pub dpop_authserver_nonce: String,
    pub request_uri: String,
}

#[derive(Deserialize)]
struct ParResponseBody {
    request_uri: String,
}

/// Push the authorization request to the Authorization Server and return
/// everything the callback will need to finish the flow.
pub async fn send_par_request(
    http: &reqwest::Client,
    guard: &SafeUrlGuard,
    request: ParRequest<'_>,
) -> Result<ParOutcome> {
    let par_url = request
        .meta
        .pushed_authorization_request_endpoint
        .as_deref()
        .ok_or_else(|| Error::Par("metadata has no PAR endpoint".to_string()))?;
    // PAR endpoint URL comes from an untrusted metadata document.
    guard.ensure_safe(par_url).await?;

    let state = generate_token(32);
    let pkce_verifier = generate_token(48);
    let code_challenge = code_challenge_s256(&pkce_verifier);

    let client_assertion = client_assertion_jwt(
        request.client_id,
        request.authserver_url,
        request.client_key,
        request.client_kid,
    )?;

    let mut form: Vec<(&str, &str)> = vec![
        ("response_type", "code"),
        ("code_challenge", &code_challenge),
        ("code_challenge_method", "S256"),
        ("client_id", request.client_id),
        ("state", &state),
        ("redirect_uri", request.redirect_uri),
        ("scope", request.scope),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE),
        ("client_assertion", &client_assertion),
    ];
    if let Some(hint) = request.login_hint {
        form.push(("login_hint", hint));
    }

    let (resp, nonce) = send_with_nonce_retry(
        |nonce| {
            let proof = authserver_proof("POST", par_url, nonce, request.dpop_key)?;
            Ok(http.post(par_url).header("DPoP", proof).form(&form))
        },
        None,
        wants_authserver_nonce,
    )
    .await?;

    if !resp.status.is_success() {
        return Err(Error::Par(format!(
            "authserver returned {}: {}",
            resp.status,
            resp.error_field().unwrap_or_default()
        )));
    }

    let body: ParResponseBody = resp
        .json()
        .map_err(|_| Error::Par("response body did not parse".to_string()))?;
    info!(request_uri = %body.request_uri, "pushed authorization request accepted");

    Ok(ParOutcome {
        state,
        pkce_verifier,
        dpop_authserver_nonce: nonce.unwrap_or_default(),
        request_uri: body.request_uri,
    })
}
