use axum::{extract::State, http::StatusCode, response::IntoResponse};
use fleet_core::{bus::Bus, storage::Storage};

use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Ready iff the broker connection is up and the database answers.
pub async fn readyz(State(app): State<AppState>) -> impl IntoResponse {
    if !app.bus.healthy() {
        return (StatusCode::SERVICE_UNAVAILABLE, "mqtt disconnected");
    }
    if app.store.ping().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "database unreachable");
    }
    (StatusCode::OK, "ready")
}
