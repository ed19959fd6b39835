use std::net::SocketAddr;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wstapp::{
    api::v1::auth::seed_admin,
    app::{router, AppState},
    config::Config,
};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed listening for shutdown signal: {}", err);
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wstapp=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let app_state = AppState::new(&config)
        .await
        .context("invalid MongoDB connection string")?;

    app_state
        .run_migration()
        .await
        .context("failed running migrations")?;

    if let Some(seed) = &config.admin {
        seed_admin(&app_state.user_collection, &app_state.argon, seed)
            .await
            .context("failed seeding admin account")?;
    }

    let app = router(app_state, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
