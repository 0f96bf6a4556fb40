use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use fleet_core::error::CoreError;
use fleet_core::model::HomeId;
use fleet_core::storage::{DeviceFilter, Storage};
use serde::Deserialize;

use crate::http::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct HubsQuery {
    pub status: Option<String>,
}

pub async fn hubs(
    State(app): State<AppState>,
    Query(query): Query<HubsQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut hubs = app.store.list_hubs(None).await.map_err(CoreError::from)?;
    match query.status.as_deref() {
        Some("online") => hubs.retain(|h| h.online),
        Some("offline") => hubs.retain(|h| !h.online),
        Some(other) => {
            return Err(ApiError(CoreError::validation(format!(
                "status must be online or offline, got {other}"
            ))));
        }
        None => {}
    }
    Ok(Json(hubs))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesQuery {
    pub home_id: Option<i64>,
    pub model_id: Option<String>,
    pub online: Option<bool>,
}

pub async fn devices(
    State(app): State<AppState>,
    Query(query): Query<DevicesQuery>,
) -> ApiResult<impl IntoResponse> {
    let devices = app
        .store
        .list_devices(DeviceFilter {
            home_id: query.home_id.map(HomeId),
            model_id: query.model_id,
            online: query.online,
        })
        .await
        .map_err(CoreError::from)?;
    Ok(Json(devices))
}
