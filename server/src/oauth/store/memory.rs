use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use crate::errors::{Error, Result};
use crate::oauth::store::{AuthRequestStore, OAuthSession, PendingAuthRequest, SessionStore};

/// In-memory store with the same semantics as [`super::PgStore`]. Used in
/// tests and for running without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<String, PendingAuthRequest>>,
    sessions: RwLock<HashMap<String, OAuthSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthRequestStore for MemoryStore {
    async fn put_auth_request(&self, request: PendingAuthRequest) -> Result<()> {
        self.requests
            .write()
            .await
            .insert(request.state.clone(), request);
        Ok(())
    }

    async fn take_auth_request(&self, state: &str) -> Result<Option<PendingAuthRequest>> {
        Ok(self.requests.write().await.remove(state))
    }

    async fn purge_stale_auth_requests(&self, max_age_secs: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::seconds(max_age_secs);
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, r| r.created_at >= cutoff);
        Ok((before - requests.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: OAuthSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.did) {
            return Err(Error::SessionConflict(session.did.clone()));
        }
        sessions.insert(session.did.clone(), session);
        Ok(())
    }

    async fn get_session(&self, did: &str) -> Result<Option<OAuthSession>> {
        Ok(self.sessions.read().await.get(did).cloned())
    }

    async fn update_session_tokens(
        &self,
        did: &str,
        access_token: &str,
        refresh_token: &str,
        dpop_authserver_nonce: &str,
    ) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(did) {
            session.access_token = access_token.to_string();
            session.refresh_token = refresh_token.to_string();
            session.dpop_authserver_nonce = dpop_authserver_nonce.to_string();
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_pds_nonce(&self, did: &str, nonce: &str) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(did) {
            session.dpop_pds_nonce = nonce.to_string();
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_session(&self, did: &str) -> Result<()> {
        self.sessions.write().await.remove(did);
        Ok(())
    }
}
