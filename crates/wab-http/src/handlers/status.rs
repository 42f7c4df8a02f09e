//! Health and status endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use wab_core::formatting::format_uptime;

use crate::state::AppState;

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;
    let storage = services.store.status();
    let database = services.store.health_check().await;
    let uptime = services.uptime();
    let sessions: Vec<_> = state
        .sessions
        .session_states()
        .into_iter()
        .map(|(phone, st)| serde_json::json!({ "phoneNumber": phone, "state": st }))
        .collect();

    let body = serde_json::json!({
        "status": "ok",
        "storage": storage,
        "database": database,
        "activeConnections": state.sessions.active_connections(),
        "sessions": sessions,
        "uptime": format_uptime(uptime),
        "uptimeSeconds": uptime.as_secs(),
        "vcf": services.distributor.vcf().compiled_info().await,
        "scheduler": services.scheduler.status().await,
    });
    (StatusCode::OK, axum::Json(body))
}

pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;
    let body = serde_json::json!({
        "botName": services.cfg.bot_name,
        "version": services.cfg.bot_version,
        "activeConnections": state.sessions.active_connections(),
        "uptime": format_uptime(services.uptime()),
        "storageType": services.store.status().backend,
    });
    (StatusCode::OK, axum::Json(body))
}
