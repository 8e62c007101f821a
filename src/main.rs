use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;

use escrow_jobs::handlers::create_router;
use escrow_jobs::{AppState, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let app_state = AppState::new(&settings).await?;

    if settings.background_jobs_enabled {
        app_state.jobs.start(settings.jobs.clone())?;
    } else {
        info!("background jobs disabled");
    }

    let app = create_router(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "escrow service starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.jobs.stop().await;
    info!("escrow service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
