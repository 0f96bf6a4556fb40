use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use fleet_core::command::CommandInput;
use fleet_core::error::CoreError;
use fleet_core::model::{DeviceId, HomeId, ResetKind, RoomId};
use fleet_core::storage::Storage;
use serde::{Deserialize, Serialize};

use super::ensure_device_access;
use crate::http::auth::AuthenticatedUser;
use crate::http::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateHubBody {
    pub hub_id: String,
    pub setup_code: String,
    pub home_id: i64,
}

pub async fn activate_hub(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Json(body): Json<ActivateHubBody>,
) -> ApiResult<impl IntoResponse> {
    let claim = app
        .inventory
        .claim_hub(&authed.user, &body.hub_id, &body.setup_code, HomeId(body.home_id))
        .await?;
    // start tracking rule deployment for the new hub right away
    app.automations
        .ensure_hub_deployment(&claim.hub.hub_id, claim.hub.home_id)
        .await
        .map_err(CoreError::from)?;
    Ok((StatusCode::CREATED, Json(claim)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDeviceBody {
    pub serial: String,
    pub setup_code: String,
    pub home_id: i64,
    pub room_id: Option<i64>,
}

pub async fn claim_device(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Json(body): Json<ClaimDeviceBody>,
) -> ApiResult<impl IntoResponse> {
    let claim = app
        .inventory
        .claim_device(
            &authed.user,
            &body.serial,
            &body.setup_code,
            HomeId(body.home_id),
            body.room_id.map(RoomId),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(claim)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSubmitted {
    pub cmd_id: String,
    pub status: fleet_core::model::CommandStatus,
}

/// Accepts a raw payload for MQTT devices or `{action, params}` for Zigbee
/// ones; returns as soon as the PENDING row is durable.
pub async fn command(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
    Json(input): Json<CommandInput>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup_device(&app, id).await?;
    ensure_device_access(&app, &authed, &device).await?;
    let command = app.commands.submit_device_command(device.id, input, false).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandSubmitted { cmd_id: command.cmd_id, status: command.status }),
    ))
}

pub async fn reset_connection(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    revoke(app, authed, id, ResetKind::Reconnect).await
}

pub async fn factory_reset(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    revoke(app, authed, id, ResetKind::FactoryReset).await
}

async fn revoke(
    app: AppState,
    authed: AuthenticatedUser,
    id: i64,
    kind: ResetKind,
) -> ApiResult<impl IntoResponse> {
    let device = lookup_device(&app, id).await?;
    ensure_device_access(&app, &authed, &device).await?;
    let command = app.inventory.revoke(device.id, kind).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandSubmitted { cmd_id: command.cmd_id, status: command.status }),
    ))
}

async fn lookup_device(app: &AppState, id: i64) -> ApiResult<fleet_core::model::Device> {
    app.store
        .get_device(DeviceId(id))
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| ApiError(CoreError::not_found(format!("device {id}"))))
}
