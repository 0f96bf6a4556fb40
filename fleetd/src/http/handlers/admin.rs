use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use fleet_core::error::CoreError;
use fleet_core::model::{CommandStatus, DeviceId, HomeId};
use fleet_core::storage::{CommandFilter, EventFilter, Storage};
use serde::Deserialize;

use crate::http::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 200;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub home_id: Option<i64>,
    pub device_id: Option<i64>,
    pub date: Option<chrono::NaiveDate>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub limit: Option<usize>,
}

pub async fn events(
    State(app): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    let rows = app
        .store
        .list_events(EventFilter {
            home_id: query.home_id.map(HomeId),
            device_id: query.device_id.map(DeviceId),
            date: query.date,
            event_type: query.event_type,
            limit: query.limit.unwrap_or(DEFAULT_LIMIT),
        })
        .await
        .map_err(CoreError::from)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsQuery {
    pub status: Option<String>,
    pub device_id: Option<i64>,
    pub date: Option<chrono::NaiveDate>,
    pub limit: Option<usize>,
}

pub async fn commands(
    State(app): State<AppState>,
    Query(query): Query<CommandsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            serde_json::from_value::<CommandStatus>(serde_json::Value::String(raw.to_string()))
                .map_err(|_| {
                    ApiError(CoreError::validation(format!("unknown command status {raw}")))
                })?,
        ),
    };
    let rows = app
        .store
        .list_commands(CommandFilter {
            status,
            device_id: query.device_id.map(DeviceId),
            date: query.date,
            limit: query.limit.unwrap_or(DEFAULT_LIMIT),
        })
        .await
        .map_err(CoreError::from)?;
    Ok(Json(rows))
}

/// Retry by numeric row id or by cmdId; only terminal non-ACKED rows
/// qualify.
pub async fn retry(
    State(app): State<AppState>,
    Path(id_or_cmd_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let command = app.commands.retry(&id_or_cmd_id).await?;
    Ok(Json(command))
}
