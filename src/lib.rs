pub mod api;
pub mod artifact_store;
pub mod audit;
pub mod auth;
pub mod config;
pub mod encoder;
pub mod error;
pub mod mirror;
pub mod models;
pub mod store;
pub mod worker;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    artifact_store::ObjectStore, auth::WebhookVerifier, store::JobStore, worker::ExportWorker,
};

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub worker: ExportWorker,
    pub objects: Option<ObjectStore>,
    pub webhook: WebhookVerifier,
}

impl AppState {
    pub fn new(
        worker: ExportWorker,
        objects: Option<ObjectStore>,
        webhook: WebhookVerifier,
    ) -> Self {
        Self {
            store: worker.store().clone(),
            worker,
            objects,
            webhook,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/api/export", post(api::create_export))
        .route("/api/export/status/{job_id}", get(api::get_export_status))
        .route("/api/export/webhook", post(api::export_webhook))
        .route("/api/export/download/{token}", get(api::download_export))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
