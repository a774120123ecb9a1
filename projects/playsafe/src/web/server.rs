use crate::cli::{ModelArgs, ServeArgs};
use crate::config::PipelineConfig;
use crate::web::api;
use crate::web::assets::{index_handler, static_handler};
use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared, read-only server settings
pub struct AppState {
    pub output_root: PathBuf,
    pub models: ModelArgs,
    pub config: PipelineConfig,
}

pub fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let files = ServeDir::new(&state.output_root);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/runs", get(api::get_runs).post(api::create_run_handler))
        .route("/api/runs/:id/progress", get(api::progress_handler))
        .route("/api/runs/:id/status", get(api::status_handler))
        .route("/api/runs/:id/stats", get(api::stats_handler))
        .route("/api/runs/:id/stop", post(api::stop_handler))
        .nest_service("/files", files)
        .route("/assets/*path", get(static_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(args: ServeArgs) -> Result<()> {
    let output_root = PathBuf::from(&args.output_root);
    std::fs::create_dir_all(&output_root)?;

    let config = args.models.pipeline_config()?;
    let state = Arc::new(AppState {
        output_root,
        models: args.models.clone(),
        config,
    });

    let mut current_port = args.port;
    let listener = loop {
        let addr = SocketAddr::new(args.host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Must be non-blocking before Tokio takes it over
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    };

    let app = build_router(state, args.max_upload_mb * 1024 * 1024);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "PlaySafe server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
