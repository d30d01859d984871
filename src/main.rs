// MeetMate API server

use axum::middleware;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use meetmate::{
    api::create_api_router,
    app_state::AppState,
    config::Config,
    rate_limit::rate_limit_middleware,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize application state
    let app_state = AppState::new(config).await?;
    let limiter = app_state.limiter.clone();
    let addr: SocketAddr = app_state.config.server_address().parse()?;

    // Evict idle rate-limit state in the background.
    let purge_limiter = limiter.clone();
    let purge_idle = Duration::from_secs(app_state.config.rate_limit.purge_idle_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            purge_limiter.purge_idle(purge_idle).await;
        }
    });

    // Build application router
    let app = create_api_router(app_state)
        .layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive());

    // Start server
    tracing::info!("MeetMate server starting on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
