use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use axum::response::Response;
use fleet_core::error::CoreError;
use fleet_core::inventory::{NewDeviceItem, NewHubItem};
use fleet_core::storage::Storage;
use serde::Deserialize;

use crate::http::error::ApiResult;
use crate::state::AppState;

/// POST bodies accept a single item or a `{"items": [...]}` batch.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum CreateBody<T> {
    Bulk { items: Vec<T> },
    Single(T),
}

pub async fn list_hubs(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rows = app.store.list_hub_inventory().await.map_err(CoreError::from)?;
    Ok(Json(rows))
}

pub async fn create_hubs(
    State(app): State<AppState>,
    Json(body): Json<CreateBody<NewHubItem>>,
) -> ApiResult<Response> {
    match body {
        CreateBody::Single(item) => {
            let created = app.inventory.create_hub_item(item).await?;
            Ok((StatusCode::CREATED, Json(created)).into_response())
        }
        CreateBody::Bulk { items } => {
            let outcome = app.inventory.bulk_create_hubs(items).await;
            let status =
                if outcome.errors.is_empty() { StatusCode::CREATED } else { StatusCode::MULTI_STATUS };
            Ok((status, Json(outcome)).into_response())
        }
    }
}

pub async fn list_devices(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rows = app.store.list_device_inventory().await.map_err(CoreError::from)?;
    Ok(Json(rows))
}

pub async fn create_devices(
    State(app): State<AppState>,
    Json(body): Json<CreateBody<NewDeviceItem>>,
) -> ApiResult<Response> {
    match body {
        CreateBody::Single(item) => {
            let created = app.inventory.create_device_item(item).await?;
            Ok((StatusCode::CREATED, Json(created)).into_response())
        }
        CreateBody::Bulk { items } => {
            let outcome = app.inventory.bulk_create_devices(items).await;
            let status =
                if outcome.errors.is_empty() { StatusCode::CREATED } else { StatusCode::MULTI_STATUS };
            Ok((status, Json(outcome)).into_response())
        }
    }
}

/// CSV dump of both inventories. Setup codes are hashes-only by
/// construction, so nothing secret can leak here.
pub async fn export(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let hubs = app.store.list_hub_inventory().await.map_err(CoreError::from)?;
    let devices = app.store.list_device_inventory().await.map_err(CoreError::from)?;

    let mut csv = String::from("kind,id,serial,model_id,protocol,status,claimed_home_id\n");
    for hub in hubs {
        csv.push_str(&format!(
            "hub,{},{},{},,{},{}\n",
            hub.hub_id,
            hub.serial.unwrap_or_default(),
            hub.model_id,
            enum_str(&hub.status),
            hub.claimed_home_id.map(|h| h.0.to_string()).unwrap_or_default(),
        ));
    }
    for device in devices {
        csv.push_str(&format!(
            "device,{},{},{},{},{},{}\n",
            device.device_uid,
            device.serial,
            device.model_id,
            enum_str(&device.protocol),
            enum_str(&device.status),
            device.claimed_home_id.map(|h| h.0.to_string()).unwrap_or_default(),
        ));
    }
    Ok(([(header::CONTENT_TYPE, "text/csv")], csv))
}

fn enum_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}
