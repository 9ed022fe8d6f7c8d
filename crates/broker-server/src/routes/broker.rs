use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use broker_core::{parse_datetime, Broker, BrokerError, Location, PickupRequest, Purpose};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{no_accounts, resp_fail, resp_ok, AppError};

pub struct BrokerState {
    pub broker: Broker,
}

fn bad(message: &str) -> AppError {
    AppError(BrokerError::BadRequest(message.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityParams {
    device: Option<String>,
    purpose: Option<String>,
    region: Option<String>,
}

pub async fn availability(
    State(state): State<Arc<BrokerState>>,
    Query(params): Query<AvailabilityParams>,
) -> Result<Response, AppError> {
    let device = params.device.ok_or_else(|| bad("device is required"))?;
    let purpose = params
        .purpose
        .map(|p| Purpose::from(p.as_str()))
        .ok_or_else(|| bad("purpose is required"))?;

    let availability = state
        .broker
        .get_availability(&device, &purpose, params.region.as_deref())
        .await?;
    Ok(resp_ok(serde_json::to_value(&availability).ok()))
}

pub async fn pickup(
    State(state): State<Arc<BrokerState>>,
    Path(device): Path<String>,
    body: Option<Json<PickupRequest>>,
) -> Result<Response, AppError> {
    let Some(Json(request)) = body else {
        return Err(bad("purpose is required"));
    };

    let grant = state.broker.get_account(&device, &request).await?;

    if request.logging.unwrap_or(true) {
        if let Ok(stats) = state.broker.stats().await {
            info!(device, username = %grant.username, stats = ?stats, "account handed out");
        }
    }

    Ok(resp_ok(serde_json::to_value(&grant).ok()))
}

pub async fn info(
    State(state): State<Arc<BrokerState>>,
    Path(device): Path<String>,
) -> Result<Response, AppError> {
    match state.broker.get_account_info(&device).await? {
        Some(grant) => Ok(resp_ok(serde_json::to_value(&grant).ok())),
        None => Ok(no_accounts()),
    }
}

pub async fn set_level(
    State(state): State<Arc<BrokerState>>,
    Path((device, level)): Path<(String, i64)>,
) -> Result<Response, AppError> {
    state.broker.set_level(&device, level).await?;
    Ok(resp_ok(None))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseBody {
    reason: Option<String>,
    encounters: Option<i64>,
    level: Option<i64>,
}

pub async fn burned(
    State(state): State<Arc<BrokerState>>,
    Path(device): Path<String>,
    body: Option<Json<ReleaseBody>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match state
        .broker
        .set_burned(&device, body.reason, body.encounters, body.level)
        .await?
    {
        Some(username) => Ok(resp_ok(Some(
            json!({"username": username, "status": "burned"}),
        ))),
        None => Ok(resp_ok(None)),
    }
}

pub async fn login(
    State(state): State<Arc<BrokerState>>,
    Path(device): Path<String>,
) -> Result<Response, AppError> {
    match state.broker.set_login(&device).await? {
        Some(username) => Ok(resp_ok(Some(
            json!({"username": username, "status": "logged in"}),
        ))),
        None => Ok(resp_ok(None)),
    }
}

pub async fn logout(
    State(state): State<Arc<BrokerState>>,
    Path(device): Path<String>,
    body: Option<Json<ReleaseBody>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match state
        .broker
        .set_logout(&device, body.encounters, body.level)
        .await?
    {
        Some(username) => Ok(resp_ok(Some(
            json!({"username": username, "status": "logged out"}),
        ))),
        None => Ok(resp_ok(None)),
    }
}

#[derive(Debug, Deserialize)]
pub struct SoftbanBody {
    time: Value,
    location: Value,
}

pub async fn softban(
    State(state): State<Arc<BrokerState>>,
    Path(device): Path<String>,
    body: Option<Json<SoftbanBody>>,
) -> Result<Response, AppError> {
    let Some(Json(body)) = body else {
        return Err(bad("time and location are required"));
    };
    let time = parse_datetime(&body.time).ok_or_else(|| bad("unparseable time"))?;
    let location: Location =
        serde_json::from_value(body.location).map_err(|_| bad("unparseable location"))?;

    state.broker.set_softban(&device, time, &location).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn stats(State(state): State<Arc<BrokerState>>) -> Result<Response, AppError> {
    let stats = state.broker.stats().await?;
    Ok(Json(stats).into_response())
}

pub async fn probe(State(state): State<Arc<BrokerState>>) -> Result<Response, AppError> {
    let diagnostics = state.broker.diagnostics().await?;
    Ok(resp_ok(Some(diagnostics)))
}

pub async fn fallback(method: Method, uri: Uri) -> Response {
    debug!(%method, %uri, "unhandled request");
    resp_fail(StatusCode::BAD_REQUEST, Some(json!("Unhandled request")))
}
