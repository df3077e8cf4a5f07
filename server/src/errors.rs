use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Error taxonomy for the OAuth/DPoP subsystem.
///
/// Trust-boundary failures (SSRF, metadata validation, state/issuer/scope/DID
/// checks) are fatal to the request and never retried. Transient upstream
/// failures are retried exactly once where the flow says so, then surfaced.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsafe fetch target: {0}")]
    UnsafeTarget(String),

    #[error("invalid authorization server metadata: {0}")]
    InvalidAuthServerMetadata(String),

    #[error("not a valid handle, DID, or auth server URL: {0}")]
    BadIdentifier(String),

    #[error("could not resolve identity: {0}")]
    IdentityNotFound(String),

    #[error("DID document has no PDS endpoint")]
    EndpointNotFound,

    #[error("Invalid state")]
    ReplayedState,

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("DID mismatch")]
    IdentityMismatch,

    #[error("scope mismatch")]
    ScopeMismatch,

    #[error("pushed authorization request failed: {0}")]
    Par(String),

    #[error("token request failed: {0}")]
    TokenRequest(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("session already exists for {0}")]
    SessionConflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("signing error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("key error: {0}")]
    Key(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// HTTP status this error maps to at the edge.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::UnsafeTarget(_)
            | Error::InvalidAuthServerMetadata(_)
            | Error::BadIdentifier(_)
            | Error::ReplayedState
            | Error::IssuerMismatch
            | Error::IdentityMismatch
            | Error::ScopeMismatch => StatusCode::BAD_REQUEST,
            Error::IdentityNotFound(_) | Error::EndpointNotFound => StatusCode::NOT_FOUND,
            Error::SessionConflict(_) => StatusCode::CONFLICT,
            Error::Par(_)
            | Error::TokenRequest(_)
            | Error::Refresh(_)
            | Error::Storage(_)
            | Error::Upstream(_)
            | Error::Jwt(_)
            | Error::Key(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self, "Request error");

        let status = self.status();
        // The Display impls never include key material or raw upstream bodies,
        // so they are safe to hand back to the caller.
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}
