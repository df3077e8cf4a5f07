use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Utc;
use reqwest::Method;
use serde::Deserialize;
use tower_cookies::Cookies;
use tracing::{info, instrument};

use crate::auth::{clear_session_cookie, session_did_from_cookie, set_session_cookie, AuthSession};
use crate::did::{is_valid_did, pds_endpoint, Identifier};
use crate::errors::{Error, Result};
use crate::oauth::jwk;
use crate::oauth::metadata::{fetch_authserver_meta, resolve_pds_authserver};
use crate::oauth::par::{send_par_request, ParRequest};
use crate::oauth::proxy::pds_authed_request;
use crate::oauth::store::{OAuthSession, PendingAuthRequest};
use crate::oauth::token::{initial_token_request, refresh_token_request, ClientAuth};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
}

/// Start the login flow: resolve the identity, validate its authserver, push
/// the authorization request, and hand the frontend the URL to redirect to.
#[instrument(skip(state, body), fields(identifier = %body.identifier))]
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>> {
    let raw = body.identifier.trim();
    let identifier = Identifier::parse(raw)?;

    // Login can start from a handle, a DID, or an authserver/PDS URL. With a
    // bare URL we know nothing about the account yet.
    let (login_hint, did, handle, pds_url, authserver_url) = match &identifier {
        Identifier::Handle(_) | Identifier::Did(_) => {
            let (did, handle, doc) = state.resolver.resolve(&identifier).await?;
            let pds = pds_endpoint(&doc)?;
            info!(%handle, %pds, "account resolved");
            let authserver =
                resolve_pds_authserver(&state.http, &state.guard, &pds).await?;
            (
                Some(raw.to_string()),
                Some(did),
                Some(handle),
                Some(pds),
                authserver,
            )
        }
        Identifier::ServerUrl(url) => {
            state.guard.ensure_safe(url).await?;
            // The URL may be a PDS; if the protected-resource lookup fails,
            // treat it as an authserver directly.
            let authserver = match resolve_pds_authserver(&state.http, &state.guard, url).await
            {
                Ok(authserver) => authserver,
                Err(_) => url.clone(),
            };
            (None, None, None, None, authserver)
        }
    };

    let meta = fetch_authserver_meta(&state.http, &state.guard, &authserver_url).await?;

    // Fresh DPoP key for this login attempt; it stays bound to the token
    // lineage for the life of the session.
    let dpop_key = jwk::generate_key();

    let client_id = state.client_id();
    let redirect_uri = state.redirect_uri();
    let outcome = send_par_request(
        &state.http,
        &state.guard,
        ParRequest {
            authserver_url: &authserver_url,
            meta: &meta,
            login_hint: login_hint.as_deref(),
            client_id: &client_id,
            redirect_uri: &redirect_uri,
            scope: &state.oauth.scope,
            client_key: &state.oauth.signing_key,
            client_kid: &state.oauth.kid,
            dpop_key: &dpop_key,
        },
    )
    .await?;

    state
        .store
        .put_auth_request(PendingAuthRequest {
            state: outcome.state,
            authserver_issuer: meta.issuer.clone(),
            did,
            handle,
            pds_url,
            pkce_verifier: outcome.pkce_verifier,
            scope: state.oauth.scope.clone(),
            dpop_authserver_nonce: outcome.dpop_authserver_nonce,
            dpop_private_key: jwk::key_to_pem(&dpop_key)?,
            created_at: Utc::now(),
        })
        .await?;

    // The authorization endpoint is untrusted metadata too; check before
    // sending the user's browser there.
    state.guard.ensure_safe(&meta.authorization_endpoint).await?;
    let query = serde_urlencoded::to_string([
        ("client_id", client_id.as_str()),
        ("request_uri", outcome.request_uri.as_str()),
    ])
    .map_err(|e| Error::Par(format!("failed to encode redirect query: {e}")))?;

    Ok(Json(serde_json::json!({
        "redirect_url": format!("{}?{}", meta.authorization_endpoint, query),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub state: String,
    pub iss: String,
    pub code: String,
}

/// Finish the login flow: consume the pending request, exchange the code,
/// verify the account identity, and establish the session.
#[instrument(skip_all, fields(state = %params.state))]
pub async fn callback(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect> {
    // Consuming the row here is the replay defense: a second callback with
    // the same state finds nothing.
    let pending = state
        .store
        .take_auth_request(&params.state)
        .await?
        .ok_or(Error::ReplayedState)?;

    if pending.authserver_issuer != params.iss {
        return Err(Error::IssuerMismatch);
    }

    let client_id = state.client_id();
    let redirect_uri = state.redirect_uri();
    let auth = ClientAuth {
        client_id: &client_id,
        redirect_uri: &redirect_uri,
        key: &state.oauth.signing_key,
        kid: &state.oauth.kid,
    };
    let (tokens, authserver_nonce) =
        initial_token_request(&state.http, &state.guard, &pending, &params.code, &auth)
            .await?;

    // The authserver's word on who logged in must agree with the identity
    // the flow started from.
    let (did, handle, pds_url) = match (&pending.did, &pending.pds_url) {
        (Some(did), Some(pds_url)) => {
            if tokens.sub != *did {
                return Err(Error::IdentityMismatch);
            }
            (did.clone(), pending.handle.clone(), pds_url.clone())
        }
        _ => {
            // Flow started from a bare server URL; the token response names
            // the account, so resolve it now and confirm it really lives
            // behind the authserver we talked to.
            if !is_valid_did(&tokens.sub) {
                return Err(Error::IdentityMismatch);
            }
            let (did, handle, doc) = state
                .resolver
                .resolve(&Identifier::Did(tokens.sub.clone()))
                .await?;
            let pds_url = pds_endpoint(&doc)?;
            let authserver =
                resolve_pds_authserver(&state.http, &state.guard, &pds_url).await?;
            if authserver != pending.authserver_issuer {
                return Err(Error::IssuerMismatch);
            }
            (did, Some(handle), pds_url)
        }
    };

    if tokens.scope.as_deref() != Some(pending.scope.as_str()) {
        return Err(Error::ScopeMismatch);
    }

    let refresh_token = tokens
        .refresh_token
        .ok_or_else(|| Error::TokenRequest("no refresh token granted".to_string()))?;

    state
        .store
        .create_session(OAuthSession {
            did: did.clone(),
            handle,
            pds_url,
            authserver_issuer: pending.authserver_issuer,
            access_token: tokens.access_token,
            refresh_token,
            dpop_authserver_nonce: authserver_nonce,
            dpop_pds_nonce: String::new(),
            dpop_private_key: pending.dpop_private_key,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await?;

    info!(%did, "oauth session established");
    set_session_cookie(&cookies, &state, &did);
    Ok(Redirect::to("/"))
}

/// Force a token refresh for the current session.
pub async fn refresh(
    State(state): State<AppState>,
    auth_session: AuthSession,
) -> Result<Json<serde_json::Value>> {
    let session = auth_session.session;
    let client_id = state.client_id();
    let redirect_uri = state.redirect_uri();
    let auth = ClientAuth {
        client_id: &client_id,
        redirect_uri: &redirect_uri,
        key: &state.oauth.signing_key,
        kid: &state.oauth.kid,
    };

    let (tokens, authserver_nonce) =
        refresh_token_request(&state.http, &state.guard, &session, &auth).await?;
    let refresh_token = tokens
        .refresh_token
        .unwrap_or_else(|| session.refresh_token.clone());
    state
        .store
        .update_session_tokens(
            &session.did,
            &tokens.access_token,
            &refresh_token,
            &authserver_nonce,
        )
        .await?;

    Ok(Json(serde_json::json!({ "did": session.did })))
}

/// Tear down the session and clear the cookie. Safe to call when not logged
/// in.
pub async fn logout(State(state): State<AppState>, cookies: Cookies) -> Result<Redirect> {
    if let Some(did) = session_did_from_cookie(&cookies, &state) {
        state.store.delete_session(&did).await?;
        info!(%did, "logged out");
    }
    clear_session_cookie(&cookies, &state);
    Ok(Redirect::to("/"))
}

/// Who the current session belongs to, straight from the account's PDS.
pub async fn whoami(
    State(state): State<AppState>,
    auth_session: AuthSession,
) -> Result<Response> {
    let session = auth_session.session;
    let client_id = state.client_id();
    let redirect_uri = state.redirect_uri();
    let auth = ClientAuth {
        client_id: &client_id,
        redirect_uri: &redirect_uri,
        key: &state.oauth.signing_key,
        kid: &state.oauth.kid,
    };

    let url = format!("{}/xrpc/com.atproto.server.getSession", session.pds_url);
    let resp = pds_authed_request(
        &state.http,
        &state.guard,
        state.store.as_ref(),
        &auth,
        &session,
        Method::GET,
        &url,
        None,
    )
    .await?;

    // Pass the PDS answer through untouched, status and all.
    Ok((
        resp.status,
        [(header::CONTENT_TYPE, "application/json")],
        resp.body,
    )
        .into_response())
}

/// OAuth client metadata document; its URL doubles as the client_id.
pub async fn client_metadata(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let fqdn = format!("{}://{}", state.protocol, state.domain);
    let jwk = jwk::public_jwk(&state.oauth.signing_key)?;

    Ok(Json(serde_json::json!({
        "client_id": state.client_id(),
        "application_type": "web",
        "client_name": "ynot",
        "client_uri": fqdn,
        "dpop_bound_access_tokens": true,
        "grant_types": ["authorization_code", "refresh_token"],
        "redirect_uris": [state.redirect_uri()],
        "response_types": ["code"],
        "scope": state.oauth.scope,
        "token_endpoint_auth_method": "private_key_jwt",
        "token_endpoint_auth_signing_alg": "ES256",
        "jwks": { "keys": [jwk] },
    })))
}
