use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tower_cookies::cookie::time::Duration;
use tower_cookies::cookie::SameSite;
use tower_cookies::{Cookie, Cookies};
use tracing::{error, info};

use crate::oauth::store::OAuthSession;
use crate::state::AppState;

/// Cookie holding the signed account DID.
pub const SESSION_COOKIE_NAME: &str = "ynot_session";

/// Default session cookie lifetime in days.
pub const SESSION_COOKIE_DAYS: i64 = 30;

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "detail": detail })),
    )
        .into_response()
}

/// The authenticated account for this request, loaded from the OAuth session
/// the signed cookie points at.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub session: OAuthSession,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthSession {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = match Cookies::from_request_parts(parts, state).await {
            Ok(cookies) => cookies,
            Err(_) => {
                error!("Failed to extract cookies from request");
                return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        };

        let Some(did) = session_did_from_cookie(&cookies, state) else {
            info!("No valid session cookie on request");
            return Err(unauthorized("Not logged in"));
        };

        match state.store.get_session(&did).await {
            Ok(Some(session)) => Ok(AuthSession { session }),
            Ok(None) => {
                info!(%did, "session cookie refers to a session that no longer exists");
                clear_session_cookie(&cookies, state);
                Err(unauthorized("Session expired"))
            }
            Err(err) => {
                error!(%did, ?err, "error loading session");
                Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    }
}

pub fn session_did_from_cookie(cookies: &Cookies, state: &AppState) -> Option<String> {
    cookies
        .signed(&state.cookie_key)
        .get(SESSION_COOKIE_NAME)
        .map(|c| c.value().to_string())
}

pub fn set_session_cookie(cookies: &Cookies, state: &AppState, did: &str) {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, did.to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(state.protocol == "https");
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(Duration::days(SESSION_COOKIE_DAYS));
    cookies.signed(&state.cookie_key).add(cookie);
}

pub fn clear_session_cookie(cookies: &Cookies, state: &AppState) {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, "");
    cookie.set_path("/");
    cookies.signed(&state.cookie_key).remove(cookie);
}
