use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use fleet_core::error::CoreError;
use fleet_core::model::{HomeId, PairingMode, ZigbeeDiscoveredDevice};
use fleet_core::storage::Storage;
use serde::Deserialize;
use uuid::Uuid;

use super::ensure_home_access;
use crate::http::auth::AuthenticatedUser;
use crate::http::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenBody {
    pub hub_id: String,
    pub mode: PairingMode,
    pub expected_model_id: Option<String>,
    pub claimed_serial: Option<String>,
}

pub async fn open(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Json(body): Json<OpenBody>,
) -> ApiResult<impl IntoResponse> {
    let session = app
        .pairing
        .open_session(
            &authed.user,
            &body.hub_id,
            body.mode,
            body.expected_model_id,
            body.claimed_serial,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredQuery {
    pub home_id: Option<i64>,
}

pub async fn discovered(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Query(query): Query<DiscoveredQuery>,
) -> ApiResult<impl IntoResponse> {
    let rows: Vec<ZigbeeDiscoveredDevice> = match query.home_id.map(HomeId) {
        Some(home_id) => {
            ensure_home_access(&app, &authed, home_id).await?;
            app.store.list_discovered(Some(home_id)).await.map_err(CoreError::from)?
        }
        None if authed.is_admin() => {
            app.store.list_discovered(None).await.map_err(CoreError::from)?
        }
        None => {
            let mut rows = Vec::new();
            let homes =
                app.store.home_ids_for_user(authed.user.id).await.map_err(CoreError::from)?;
            for home_id in homes {
                rows.extend(
                    app.store.list_discovered(Some(home_id)).await.map_err(CoreError::from)?,
                );
            }
            rows
        }
    };
    Ok(Json(rows))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub token: Uuid,
    pub ieee: String,
    pub model_id_override: Option<String>,
}

pub async fn confirm(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<impl IntoResponse> {
    let device = app
        .pairing
        .confirm(&authed.user, body.token, &body.ieee, body.model_id_override)
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}
