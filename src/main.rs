use std::time::Duration;

mod app;
mod config;
mod credentials;
mod institutions;
mod ratelimit;
mod session;
mod state;
mod sync;
mod vault;

use crate::state::AppState;

/// How often stale rate-limit windows are swept, independent of traffic.
const LIMITER_CLEANUP_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "unisync=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let app_state = AppState::init().await?;
    tracing::info!(production = app_state.config.production, "unisync starting");

    // Run migrations if present
    if let Err(e) = sqlx::migrate!("./migrations").run(&app_state.db).await {
        tracing::warn!(error = %e, "migrations folder not found or migration failed; continuing");
    }

    let limiter = app_state.limiter.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(LIMITER_CLEANUP_INTERVAL_SECS));
        loop {
            tick.tick().await;
            let removed = limiter.cleanup_expired();
            if removed > 0 {
                tracing::debug!(removed, "cleaned up expired rate limit windows");
            }
        }
    });

    let app = app::build_app(app_state);
    app::serve(app).await
}
