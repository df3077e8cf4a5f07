use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::errors::{Error, Result};
use crate::oauth::store::{AuthRequestStore, OAuthSession, PendingAuthRequest, SessionStore};

/// Postgres-backed store; the tables live in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[async_trait]
impl AuthRequestStore for PgStore {
    async fn put_auth_request(&self, request: PendingAuthRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_requests
                (state, authserver_issuer, did, handle, pds_url,
                 pkce_verifier, scope, dpop_authserver_nonce, dpop_private_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&request.state)
        .bind(&request.authserver_issuer)
        .bind(&request.did)
        .bind(&request.handle)
        .bind(&request.pds_url)
        .bind(&request.pkce_verifier)
        .bind(&request.scope)
        .bind(&request.dpop_authserver_nonce)
        .bind(&request.dpop_private_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_auth_request(&self, state: &str) -> Result<Option<PendingAuthRequest>> {
        // DELETE .. RETURNING is atomic: concurrent callbacks with the same
        // state can never both see the row.
        let row = sqlx::query_as::<_, PendingAuthRequest>(
            "DELETE FROM oauth_requests WHERE state = $1 RETURNING *",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn purge_stale_auth_requests(&self, max_age_secs: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM oauth_requests WHERE created_at < NOW() - make_interval(secs => $1)",
        )
        .bind(max_age_secs as f64)
        .execute(&self.pool)
        .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, "dropped stale auth requests");
        }
        Ok(purged)
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(&self, session: OAuthSession) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO oauth_sessions
                (did, handle, pds_url, authserver_issuer, access_token, refresh_token,
                 dpop_authserver_nonce, dpop_pds_nonce, dpop_private_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&session.did)
        .bind(&session.handle)
        .bind(&session.pds_url)
        .bind(&session.authserver_issuer)
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(&session.dpop_authserver_nonce)
        .bind(&session.dpop_pds_nonce)
        .bind(&session.dpop_private_key)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(Error::SessionConflict(session.did.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_session(&self, did: &str) -> Result<Option<OAuthSession>> {
        let row = sqlx::query_as::<_, OAuthSession>(
            "SELECT * FROM oauth_sessions WHERE did = $1",
        )
        .bind(did)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_session_tokens(
        &self,
        did: &str,
        access_token: &str,
        refresh_token: &str,
        dpop_authserver_nonce: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE oauth_sessions
            SET access_token = $2,
                refresh_token = $3,
                dpop_authserver_nonce = $4,
                updated_at = NOW()
            WHERE did = $1
            "#,
        )
        .bind(did)
        .bind(access_token)
        .bind(refresh_token)
        .bind(dpop_authserver_nonce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_pds_nonce(&self, did: &str, nonce: &str) -> Result<()> {
        sqlx::query(
            "UPDATE oauth_sessions SET dpop_pds_nonce = $2, updated_at = NOW() WHERE did = $1",
        )
        .bind(did)
        .bind(nonce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, did: &str) -> Result<()> {
        sqlx::query("DELETE FROM oauth_sessions WHERE did = $1")
            .bind(did)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
