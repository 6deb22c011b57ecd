//! HTTP trigger for reconciliation cycles.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dealwatch_sync::{build_engine, ReconciliationEngine, SyncConfig};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dealwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
}

impl AppState {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    service: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", get(sync_handler).post(sync_handler))
        .route("/healthz", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let engine = Arc::new(build_engine(config)?);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "trigger endpoint listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    info!("sync triggered");
    match state.engine.reconcile().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(error = %err, "sync cycle failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn health_handler() -> Json<Health> {
    Json(Health {
        status: "ok",
        service: CRATE_NAME,
    })
}
