pub mod handlers;
pub mod log_ring;
pub mod models;

use anyhow::Result;
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use handlers::AppState;

/// The admin route table, shared between the real server and tests.
pub fn router(app: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", get(handlers::get_index))
        .route("/api/status", get(handlers::get_status))
        .route("/api/switch", post(handlers::post_switch))
        .route("/api/auto-switch", post(handlers::post_auto_switch))
        .route("/api/update", post(handlers::post_update))
        .route("/api/logs", get(handlers::get_logs))
        .route("/api/subscription", get(handlers::get_subscription))
        .route("/api/ping", get(handlers::get_ping))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// 启动管理 API 服务器
pub fn start(app: AppState, bind_addr: String) -> Result<JoinHandle<()>> {
    let router = router(app);

    info!(addr = bind_addr, "admin server starting");

    let handle = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(addr = bind_addr, error = %e, "admin server bind failed");
                return;
            }
        };
        info!(addr = bind_addr, "admin server listening");
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "admin server error");
        }
    });

    Ok(handle)
}
