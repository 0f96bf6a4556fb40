use automations::RuleBody;
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use fleet_core::error::CoreError;
use fleet_core::model::HomeId;
use fleet_core::storage::Storage;

use super::ensure_home_access;
use crate::http::auth::AuthenticatedUser;
use crate::http::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(home_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    ensure_home_access(&app, &authed, HomeId(home_id)).await?;
    let rules = app.automations.list_rules(HomeId(home_id)).await.map_err(CoreError::from)?;
    Ok(Json(rules))
}

pub async fn create(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(home_id): Path<i64>,
    Json(body): Json<RuleBody>,
) -> ApiResult<impl IntoResponse> {
    ensure_home_access(&app, &authed, HomeId(home_id)).await?;
    let rule = app.automations.create_rule(HomeId(home_id), body).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
    Json(body): Json<RuleBody>,
) -> ApiResult<impl IntoResponse> {
    check_rule_access(&app, &authed, id).await?;
    let rule = app.automations.update_rule(id, body).await?;
    Ok(Json(rule))
}

pub async fn delete(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    check_rule_access(&app, &authed, id).await?;
    app.automations.delete_rule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    check_rule_access(&app, &authed, id).await?;
    Ok(Json(app.automations.set_enabled(id, true).await?))
}

pub async fn disable(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    check_rule_access(&app, &authed, id).await?;
    Ok(Json(app.automations.set_enabled(id, false).await?))
}

pub async fn hub_status(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    Path(hub_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let hub = app
        .store
        .get_hub(&hub_id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| ApiError(CoreError::not_found(format!("hub {hub_id}"))))?;
    ensure_home_access(&app, &authed, hub.home_id).await?;
    Ok(Json(app.automations.hub_status(&hub_id).await.map_err(CoreError::from)?))
}

async fn check_rule_access(
    app: &AppState,
    authed: &AuthenticatedUser,
    rule_id: i64,
) -> ApiResult<()> {
    let rule = app
        .automations
        .get_rule(rule_id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| ApiError(CoreError::not_found(format!("rule {rule_id}"))))?;
    ensure_home_access(app, authed, rule.home_id).await
}
