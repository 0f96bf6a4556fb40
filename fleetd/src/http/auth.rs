use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use fleet_core::error::CoreError;
use fleet_core::model::{User, UserId};
use fleet_core::storage::Storage;
use uuid::Uuid;

use crate::state::AppState;
use super::error::ApiError;

/// The caller behind a request: a session-backed user, or a static operator
/// token (which acts as an admin without a user row).
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub user: User,
    pub via_admin_token: bool,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.via_admin_token || self.user.is_admin
    }
}

fn admin_token_user() -> User {
    User {
        id: UserId(0),
        email: "operator@token".into(),
        password_hash: String::new(),
        is_admin: true,
        created_at: Utc::now(),
    }
}

pub async fn require_auth(
    State(app): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());

    let Some(token) = bearer else {
        return ApiError(CoreError::new(
            fleet_core::error::ErrorKind::AuthRequired,
            "missing bearer token",
        ))
        .into_response();
    };

    // static operator tokens first, compared constant-time
    if app.auth.matches(&token) {
        req.extensions_mut()
            .insert(AuthenticatedUser { user: admin_token_user(), via_admin_token: true });
        return next.run(req).await;
    }

    let Ok(parsed) = Uuid::try_parse(&token) else {
        return unauthorized();
    };
    let session = match app.store.get_session(parsed).await {
        Ok(Some(session)) if session.expires_at > Utc::now() => session,
        Ok(_) => return unauthorized(),
        Err(e) => return ApiError(CoreError::internal(e)).into_response(),
    };
    let user = match app.store.get_user(session.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return unauthorized(),
        Err(e) => return ApiError(CoreError::internal(e)).into_response(),
    };

    req.extensions_mut().insert(AuthenticatedUser { user, via_admin_token: false });
    next.run(req).await
}

pub async fn require_admin(req: Request<Body>, next: Next) -> Response {
    let authed = req.extensions().get::<AuthenticatedUser>();
    match authed {
        Some(user) if user.is_admin() => next.run(req).await,
        Some(_) => ApiError(CoreError::new(
            fleet_core::error::ErrorKind::Forbidden,
            "admin claim required",
        ))
        .into_response(),
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    ApiError(CoreError::auth_failed("invalid or expired token")).into_response()
}
