//! Administrative HTTP listener

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::indexer::IndexingService;

/// Create the admin router
pub fn router(service: Arc<IndexingService>) -> Router {
    Router::new()
        .route("/reindex", get(reindex).post(reindex))
        .with_state(service)
}

/// Serve the admin router on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    service: Arc<IndexingService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("Admin endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn reindex(State(service): State<Arc<IndexingService>>) -> (StatusCode, &'static str) {
    match service.start_reindex() {
        Ok(_) => {
            info!("Reindexing triggered over HTTP");
            (StatusCode::ACCEPTED, "Reindexing started")
        }
        Err(Error::AlreadyInProgress) => (StatusCode::CONFLICT, "Reindexing already in progress"),
        Err(e) => {
            error!("Failed to start reindexing: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to start reindexing")
        }
    }
}
