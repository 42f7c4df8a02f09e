pub mod pairing;
pub mod status;
pub mod vcf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Standard JSON error body.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, axum::Json(body)).into_response()
}
