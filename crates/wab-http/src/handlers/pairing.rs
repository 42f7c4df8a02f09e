//! Pairing code endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use wab_core::domain::PhoneNumber;

use crate::handlers::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeRequest {
    #[serde(default)]
    phone_number: String,
    #[serde(default)]
    custom_code: Option<String>,
}

pub async fn pairing_code_handler(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<PairingCodeRequest>,
) -> Response {
    let Ok(phone) = PhoneNumber::parse(&req.phone_number) else {
        return api_error(StatusCode::BAD_REQUEST, "Invalid phone number");
    };
    let custom = req
        .custom_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    match state.sessions.request_pairing_code(&phone, custom).await {
        Ok(issued) => {
            let body = serde_json::json!({
                "pairingCode": issued.code,
                "customCode": issued.custom_code,
                "status": "Use this code in WhatsApp: Linked Devices > Link with phone number",
            });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        Err(e) => {
            tracing::error!("[HTTP] Pairing code for {phone} failed: {e}");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to generate pairing code: {e}"),
            )
        }
    }
}
