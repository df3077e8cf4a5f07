use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// An in-flight authorization request, keyed by the `state` token we sent in
/// the PAR. Consumed exactly once when the callback arrives.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingAuthRequest {
    pub state: String,
    pub authserver_issuer: String,
    pub did: Option<String>,
    pub handle: Option<String>,
    pub pds_url: Option<String>,
    pub pkce_verifier: String,
    pub scope: String,
    pub dpop_authserver_nonce: String,
    /// PKCS#8 PEM of the per-login DPoP ES256 private key.
    pub dpop_private_key: String,
    pub created_at: DateTime<Utc>,
}

/// A completed OAuth session, one per account DID. The DPoP key minted at
/// login stays bound to this token lineage until logout.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OAuthSession {
    pub did: String,
    pub handle: Option<String>,
    pub pds_url: String,
    pub authserver_issuer: String,
    pub access_token: String,
    pub refresh_token: String,
    pub dpop_authserver_nonce: String,
    pub dpop_pds_nonce: String,
    pub dpop_private_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuthRequestStore: Send + Sync {
    async fn put_auth_request(&self, request: PendingAuthRequest) -> Result<()>;

    /// Remove and return the request for `state`. A second call with the same
    /// state returns `None`, which is what defeats callback replay.
    async fn take_auth_request(&self, state: &str) -> Result<Option<PendingAuthRequest>>;

    /// Drop requests older than `max_age_secs`; returns how many went.
    async fn purge_stale_auth_requests(&self, max_age_secs: i64) -> Result<u64>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with `SessionConflict` if the DID already
    /// has one.
    async fn create_session(&self, session: OAuthSession) -> Result<()>;

    async fn get_session(&self, did: &str) -> Result<Option<OAuthSession>>;

    /// Persist refreshed tokens along with the authserver nonce observed
    /// during the refresh.
    async fn update_session_tokens(
        &self,
        did: &str,
        access_token: &str,
        refresh_token: &str,
        dpop_authserver_nonce: &str,
    ) -> Result<()>;

    /// Persist a resource-server nonce learned from a PDS response.
    async fn update_pds_nonce(&self, did: &str, nonce: &str) -> Result<()>;

    async fn delete_session(&self, did: &str) -> Result<()>;
}

pub trait OAuthStore: AuthRequestStore + SessionStore + Send + Sync {}

impl<T: AuthRequestStore + SessionStore + Send + Sync> OAuthStore for T {}
