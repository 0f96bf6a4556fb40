use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{Duration, Utc};
use fleet_core::error::CoreError;
use fleet_core::model::Session;
use fleet_core::secrets;
use fleet_core::storage::Storage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::auth::AuthenticatedUser;
use crate::http::error::{ApiError, ApiResult};
use crate::state::AppState;

const SESSION_DAYS: i64 = 30;

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: Uuid,
    pub user: fleet_core::model::User,
}

pub async fn register(
    State(app): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<impl IntoResponse> {
    if !body.email.contains('@') {
        return Err(ApiError(CoreError::validation("email looks invalid")));
    }
    if body.password.len() < 8 {
        return Err(ApiError(CoreError::validation("password must be at least 8 characters")));
    }
    let hash = secrets::hash_secret(&body.password).map_err(CoreError::internal)?;
    let user = app.store.create_user(&body.email, &hash, false).await.map_err(CoreError::from)?;
    // every account starts with a home so claims have a target
    app.store.create_home("Home", user.id).await.map_err(CoreError::from)?;
    let token = issue_session(&app, user.id).await?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

pub async fn login(
    State(app): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<Json<AuthResponse>> {
    let user = app
        .store
        .get_user_by_email(&body.email)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::auth_failed("unknown email or bad password"))?;
    if !secrets::verify_secret(&body.password, &user.password_hash) {
        return Err(ApiError(CoreError::auth_failed("unknown email or bad password")));
    }
    let token = issue_session(&app, user.id).await?;
    Ok(Json(AuthResponse { token, user }))
}

pub async fn me(Extension(authed): Extension<AuthenticatedUser>) -> Json<fleet_core::model::User> {
    Json(authed.user)
}

async fn issue_session(app: &AppState, user_id: fleet_core::model::UserId) -> ApiResult<Uuid> {
    let session = Session {
        token: Uuid::new_v4(),
        user_id,
        created_at: Utc::now(),
        expires_at: Utc::now() + Duration::days(SESSION_DAYS),
    };
    app.store.insert_session(session.clone()).await.map_err(CoreError::from)?;
    Ok(session.token)
}
