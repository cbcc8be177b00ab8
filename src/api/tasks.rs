//! Task endpoints
//!
//! Each POST route takes `{ "data": "<string>" }` and forwards the string to
//! one guest export:
//! - GET /today
//! - POST /list, /agenda, /delete, /state_change - JSON reply or `{ "error" }`
//! - POST /add, /run - empty `200`
//!
//! A non-JSON guest reply is a domain rejection, not a failure, and is
//! returned with `200`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::middleware::{ApiError, AppState};
use crate::bridge::{GuestReply, Operation};

/// Request body shared by every POST route
#[derive(Debug, Deserialize)]
pub struct DataRequest {
    pub data: String,
}

impl IntoResponse for GuestReply {
    fn into_response(self) -> Response {
        match self {
            GuestReply::Payload(value) => Json(value).into_response(),
            GuestReply::Rejected(raw) => Json(json!({ "error": raw })).into_response(),
            GuestReply::Accepted => StatusCode::OK.into_response(),
        }
    }
}

async fn run(
    state: &AppState,
    op: Operation,
    body: Result<Json<DataRequest>, JsonRejection>,
) -> Result<GuestReply, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::validation_error(e.body_text()))?;
    tracing::debug!(operation = op.as_str(), "dispatching to guest");
    Ok(state.bridge.dispatch(op, request.data).await?)
}

/// Second field of the first element of a today result
fn today_body(value: &Value) -> Option<String> {
    match value.get(0)?.get(1)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// GET /today
pub async fn today(State(state): State<AppState>) -> Result<Response, ApiError> {
    let reply = state.bridge.dispatch(Operation::Today, String::new()).await?;
    Ok(match reply {
        GuestReply::Payload(value) => today_body(&value).unwrap_or_default().into_response(),
        other => other.into_response(),
    })
}

/// POST /list
pub async fn list(
    State(state): State<AppState>,
    body: Result<Json<DataRequest>, JsonRejection>,
) -> Result<GuestReply, ApiError> {
    run(&state, Operation::List, body).await
}

/// POST /agenda
pub async fn agenda(
    State(state): State<AppState>,
    body: Result<Json<DataRequest>, JsonRejection>,
) -> Result<GuestReply, ApiError> {
    run(&state, Operation::Agenda, body).await
}

/// POST /add
pub async fn add(
    State(state): State<AppState>,
    body: Result<Json<DataRequest>, JsonRejection>,
) -> Result<GuestReply, ApiError> {
    run(&state, Operation::Add, body).await
}

/// POST /delete
pub async fn delete(
    State(state): State<AppState>,
    body: Result<Json<DataRequest>, JsonRejection>,
) -> Result<GuestReply, ApiError> {
    run(&state, Operation::Delete, body).await
}

/// POST /state_change - body is `"<id> @<state>"`
pub async fn state_change(
    State(state): State<AppState>,
    body: Result<Json<DataRequest>, JsonRejection>,
) -> Result<GuestReply, ApiError> {
    run(&state, Operation::StateChange, body).await
}

/// POST /run
pub async fn run_command(
    State(state): State<AppState>,
    body: Result<Json<DataRequest>, JsonRejection>,
) -> Result<GuestReply, ApiError> {
    run(&state, Operation::Run, body).await
}
