use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use ynot::routes;
use ynot::state::AppState;

/// Stale pending auth requests are swept on this cadence.
const AUTH_REQUEST_SWEEP_SECS: u64 = 600;
const AUTH_REQUEST_MAX_AGE_SECS: i64 = 3600;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_application())
}

async fn run_application() -> color_eyre::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_state = AppState::from_env().await?;

    // Sweep abandoned login attempts so the requests table can't grow
    // unbounded.
    let sweeper_store = app_state.store.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(AUTH_REQUEST_SWEEP_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = sweeper_store
                .purge_stale_auth_requests(AUTH_REQUEST_MAX_AGE_SECS)
                .await
            {
                tracing::error!(?err, "failed to purge stale auth requests");
            }
        }
    });

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, routes::routes(app_state)).await?;
    Ok(())
}
