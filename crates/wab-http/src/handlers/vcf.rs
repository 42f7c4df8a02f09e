//! VCF status and manual distribution endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use wab_core::errors::Error;

use crate::handlers::api_error;
use crate::state::AppState;

pub async fn vcf_status_handler(State(state): State<AppState>) -> Response {
    let services = &state.services;
    let users = match services.store.list_all().await {
        Ok(users) => users,
        Err(e) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to list users: {e}"),
            )
        }
    };
    let with_names = users
        .iter()
        .filter(|u| u.display_name.as_deref().is_some_and(|n| !n.trim().is_empty()))
        .count();

    let body = serde_json::json!({
        "totalUsers": users.len(),
        "usersWithNames": with_names,
        "connectedUsers": services.registry.open_phones(),
        "compiledVcf": services.distributor.vcf().compiled_info().await,
        "scheduler": services.scheduler.status().await,
        "lastDistribution": services.distributor.last_report().await,
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}

pub async fn distribute_vcf_handler(State(state): State<AppState>) -> Response {
    match state.services.distributor.distribute().await {
        Ok(report) => {
            let body = serde_json::json!({ "success": true, "report": report });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        Err(Error::Busy(msg)) => api_error(StatusCode::CONFLICT, msg),
        Err(e) => {
            tracing::error!("[HTTP] Manual VCF distribution failed: {e}");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("VCF distribution failed: {e}"),
            )
        }
    }
}
