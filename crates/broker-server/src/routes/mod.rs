pub mod broker;

use axum::http::StatusCode;
use axum::middleware as axum_middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use broker_core::BrokerError;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::middleware::{auth_middleware, BasicAuthValidator};
pub use broker::BrokerState;

pub fn router(state: Arc<BrokerState>, validator: Arc<BasicAuthValidator>) -> Router {
    Router::new()
        .route("/get/availability", get(broker::availability))
        .route("/get/:device", get(broker::pickup).post(broker::pickup))
        .route("/get/:device/info", get(broker::info))
        .route("/set/:device/level/:level", post(broker::set_level))
        .route("/set/:device/burned", post(broker::burned))
        .route("/set/:device/login", post(broker::login))
        .route("/set/:device/logout", post(broker::logout))
        .route("/set/:device/softban", post(broker::softban))
        .route("/stats", get(broker::stats))
        .route("/test", get(broker::probe))
        .fallback(broker::fallback)
        .with_state(state)
        .layer(axum_middleware::from_fn_with_state(
            validator,
            auth_middleware,
        ))
}

/// 200 envelope. A payload that already carries a `status` key goes out
/// as-is; anything else is wrapped under `data`.
pub fn resp_ok(data: Option<Value>) -> Response {
    let body = match data {
        None => json!({"status": "ok"}),
        Some(Value::Object(map)) if map.contains_key("status") => Value::Object(map),
        Some(payload) => json!({"status": "ok", "data": payload}),
    };
    (StatusCode::OK, Json(body)).into_response()
}

pub fn resp_fail(code: StatusCode, data: Option<Value>) -> Response {
    let body = match data {
        None => json!({"status": "fail"}),
        Some(Value::Object(map)) if map.contains_key("status") => Value::Object(map),
        Some(payload) => json!({"status": "fail", "data": payload}),
    };
    (code, Json(body)).into_response()
}

pub fn no_accounts() -> Response {
    (
        StatusCode::NO_CONTENT,
        Json(json!({"error": "No accounts available"})),
    )
        .into_response()
}

pub struct AppError(pub BrokerError);

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.0 {
            BrokerError::BadRequest(message) => {
                resp_fail(StatusCode::BAD_REQUEST, Some(json!(message)))
            }
            BrokerError::NoCandidate => no_accounts(),
            BrokerError::Database(e) => {
                error!(error = %e, "store error");
                resp_fail(StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        }
    }
}
