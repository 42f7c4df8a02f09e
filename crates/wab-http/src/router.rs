//! Axum router construction.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/pairing-code", post(handlers::pairing::pairing_code_handler))
        .route("/health", get(handlers::status::health_handler))
        .route("/status", get(handlers::status::status_handler))
        .route("/vcf-status", get(handlers::vcf::vcf_status_handler))
        .route("/distribute-vcf", post(handlers::vcf::distribute_vcf_handler))
        .with_state(state)
}
