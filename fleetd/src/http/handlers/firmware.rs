use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use fleet_core::error::CoreError;
use fleet_core::storage::{NewRelease, Storage};
use serde::Deserialize;

use crate::http::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReleaseBody {
    pub target_type: String,
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size: Option<i64>,
    pub notes: Option<String>,
}

pub async fn list_releases(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rows = app.store.list_releases().await.map_err(CoreError::from)?;
    Ok(Json(rows))
}

pub async fn create_release(
    State(app): State<AppState>,
    Json(body): Json<NewReleaseBody>,
) -> ApiResult<impl IntoResponse> {
    let release = app
        .rollouts
        .create_release(NewRelease {
            target_type: body.target_type,
            version: body.version,
            url: body.url,
            sha256: body.sha256,
            size: body.size,
            notes: body.notes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(release)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRolloutBody {
    pub release_id: i64,
    pub hub_ids: Vec<String>,
}

pub async fn list_rollouts(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rows = app.rollouts.list().await.map_err(CoreError::from)?;
    Ok(Json(rows))
}

pub async fn create_rollout(
    State(app): State<AppState>,
    Json(body): Json<NewRolloutBody>,
) -> ApiResult<impl IntoResponse> {
    let rollout = app.rollouts.create_rollout(body.release_id, body.hub_ids).await?;
    Ok((StatusCode::CREATED, Json(rollout)))
}

pub async fn get_rollout(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.rollouts.view(id).await?))
}

pub async fn start_rollout(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.rollouts.start(id).await?))
}

pub async fn pause_rollout(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.rollouts.pause(id).await?))
}
