use std::env;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use color_eyre::eyre::{eyre, WrapErr};
use p256::SecretKey;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_cookies::Key;
use tracing::info;

use crate::did::IdentityResolver;
use crate::oauth::jwk;
use crate::oauth::store::{OAuthStore, PgStore};
use crate::security::SafeUrlGuard;

pub const OAUTH_SCOPE: &str = "atproto transition:generic";

/// OAuth client identity: the ES256 signing key published in the client
/// metadata JWKS, used for client assertions.
#[derive(Clone)]
pub struct OAuthConfig {
    pub signing_key: SecretKey,
    pub kid: String,
    pub scope: String,
}

impl OAuthConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        // Base64-wrapped PKCS#8 PEM, so the env var stays single-line
        let encoded = env::var("OAUTH_PRIVATE_KEY").wrap_err("OAUTH_PRIVATE_KEY is not set")?;
        let pem = String::from_utf8(
            STANDARD
                .decode(encoded)
                .wrap_err("OAUTH_PRIVATE_KEY is not valid base64")?,
        )
        .wrap_err("OAUTH_PRIVATE_KEY does not decode to UTF-8")?;

        let signing_key =
            jwk::key_from_pem(&pem).map_err(|e| eyre!("OAUTH_PRIVATE_KEY: {e}"))?;
        let kid = jwk::key_id(&signing_key).map_err(|e| eyre!("OAUTH_PRIVATE_KEY: {e}"))?;

        Ok(Self {
            signing_key,
            kid,
            scope: OAUTH_SCOPE.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OAuthStore>,
    pub http: reqwest::Client,
    pub guard: SafeUrlGuard,
    pub resolver: IdentityResolver,
    pub oauth: OAuthConfig,
    pub cookie_key: Key,
    pub domain: String,
    pub protocol: String,
}

impl AppState {
    pub async fn from_env() -> color_eyre::Result<Self> {
        let pool = setup_db_pool().await?;
        let store: Arc<dyn OAuthStore> = Arc::new(PgStore::new(pool));

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let guard = SafeUrlGuard::new(
            env::var("ALLOW_LOOPBACK_URLS").map(|v| v == "true").unwrap_or(false),
        );

        let appview_url =
            env::var("APPVIEW_URL").unwrap_or_else(|_| "https://bsky.social".to_string());
        let plc_directory_url =
            env::var("PLC_DIRECTORY_URL").unwrap_or_else(|_| "https://plc.directory".to_string());
        info!(%appview_url, %plc_directory_url, "identity resolution configured");

        let resolver =
            IdentityResolver::new(http.clone(), guard, appview_url, plc_directory_url);

        let cookie_key = cookie_key_from_env()?;

        Ok(Self {
            store,
            http,
            guard,
            resolver,
            oauth: OAuthConfig::from_env()?,
            cookie_key,
            domain: env::var("DOMAIN").wrap_err("DOMAIN is not set")?,
            protocol: env::var("PROTO").unwrap_or_else(|_| "https".to_string()),
        })
    }

    /// Public URL of the client metadata document; doubles as the OAuth
    /// client_id under the atproto profile.
    pub fn client_id(&self) -> String {
        format!("{}://{}/client-metadata.json", self.protocol, self.domain)
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}://{}/oauth/callback", self.protocol, self.domain)
    }
}

fn cookie_key_from_env() -> color_eyre::Result<Key> {
    match env::var("COOKIE_KEY") {
        Ok(encoded) => {
            let bytes = STANDARD
                .decode(encoded)
                .wrap_err("COOKIE_KEY is not valid base64")?;
            Key::try_from(bytes.as_slice()).wrap_err("COOKIE_KEY must be 64 bytes")
        }
        Err(_) => {
            info!("COOKIE_KEY not set, generating an ephemeral one");
            Ok(Key::generate())
        }
    }
}

const MIGRATION_LOCK_ID: i64 = 0x7932_6f74;

/// Connect and migrate, holding an advisory lock so concurrent instances
/// don't race the migrator.
pub async fn setup_db_pool() -> color_eyre::Result<PgPool> {
    let database_url = env::var("DATABASE_URL").wrap_err("DATABASE_URL is not set")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&pool)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&pool)
        .await?;

    Ok(pool)
}
