use axum::routing::{get, post};
use tower_cookies::CookieManagerLayer;

use crate::state::AppState;

pub mod oauth;

/// Build the application router.
pub fn routes(app_state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/oauth/login", post(oauth::login))
        .route("/oauth/callback", get(oauth::callback))
        .route("/oauth/refresh", get(oauth::refresh))
        .route("/oauth/logout", get(oauth::logout))
        .route("/oauth/whoami", get(oauth::whoami))
        .route("/client-metadata.json", get(oauth::client_metadata))
        .layer(CookieManagerLayer::new())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}
