use axum::{
    Router, middleware,
    routing::{get, post, put},
};

use crate::{
    http::{auth, handlers as h, sse},
    state::AppState,
};

pub fn build(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/inventory/hubs", get(h::inventory::list_hubs).post(h::inventory::create_hubs))
        .route(
            "/admin/inventory/devices",
            get(h::inventory::list_devices).post(h::inventory::create_devices),
        )
        .route("/admin/inventory/export", post(h::inventory::export))
        .route("/admin/fleet/hubs", get(h::fleet::hubs))
        .route("/admin/fleet/devices", get(h::fleet::devices))
        .route("/admin/events", get(h::admin::events))
        .route("/admin/commands", get(h::admin::commands))
        .route("/admin/commands/{id_or_cmd_id}/retry", post(h::admin::retry))
        .route(
            "/admin/firmware/releases",
            get(h::firmware::list_releases).post(h::firmware::create_release),
        )
        .route(
            "/admin/firmware/rollouts",
            get(h::firmware::list_rollouts).post(h::firmware::create_rollout),
        )
        .route("/admin/firmware/rollouts/{id}", get(h::firmware::get_rollout))
        .route("/admin/firmware/rollouts/{id}/start", post(h::firmware::start_rollout))
        .route("/admin/firmware/rollouts/{id}/pause", post(h::firmware::pause_rollout))
        .route_layer(middleware::from_fn(auth::require_admin));

    let protected = Router::new()
        .route("/me", get(h::auth::me))
        .route("/hubs/activate", post(h::devices::activate_hub))
        .route("/devices/claim", post(h::devices::claim_device))
        .route("/devices/{id}/command", post(h::devices::command))
        .route("/devices/{id}/reset-connection", post(h::devices::reset_connection))
        .route("/devices/{id}/factory-reset", post(h::devices::factory_reset))
        .route("/zigbee/pairing/open", post(h::zigbee::open))
        .route("/zigbee/discovered", get(h::zigbee::discovered))
        .route("/zigbee/pairing/confirm", post(h::zigbee::confirm))
        .route("/homes/{home_id}/automations", get(h::automation::list).post(h::automation::create))
        .route("/automations/{id}", put(h::automation::update).delete(h::automation::delete))
        .route("/automations/{id}/enable", post(h::automation::enable))
        .route("/automations/{id}/disable", post(h::automation::disable))
        .route("/hubs/{hub_id}/automations/status", get(h::automation::hub_status))
        .route("/events", get(sse::events))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/healthz", get(h::health::healthz))
        .route("/readyz", get(h::health::readyz))
        .route("/auth/register", post(h::auth::register))
        .route("/auth/login", post(h::auth::login))
        .merge(protected)
        .with_state(state)
}
