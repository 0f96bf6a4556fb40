//! End-to-end command lifecycle over the in-memory bus: REST submit → wire
//! publish → ACK ingestion → row transition → realtime event.

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use chrono::Utc;
use fleet_core::{
    bus::{Bus, PublishOpts},
    fanout::StreamEvent,
    model::{
        CommandStatus, DeviceStateCurrent, Hub, HubInventory, InventoryStatus, LifecycleStatus,
        Protocol,
    },
    storage::{NewDevice, Storage},
    wire,
};
use fleetd::{
    config::{AuthConfig, Config},
    http::build_router,
    state::AppState,
    wiring,
};
use serde_json::json;
use tokio::time::{Duration, sleep, timeout};
use tokio_stream::StreamExt;
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN: &str = "test-admin";

async fn harness() -> (axum::Router, AppState) {
    let cfg = Config {
        auth: AuthConfig { admin_tokens: vec![ADMIN.to_string()] },
        ..Config::default()
    };
    let state = wiring::build_state(&cfg).await.unwrap();
    wiring::spawn_workers(&state).await.unwrap();
    // let the ingest workers install their subscriptions
    sleep(Duration::from_millis(20)).await;
    (build_router(state.clone()), state)
}

async fn seed_mqtt_device(state: &AppState) -> (fleet_core::model::HomeId, fleet_core::model::Device)
{
    let user = state.store.create_user("owner@example.com", "x", false).await.unwrap();
    let home = state.store.create_home("Home", user.id).await.unwrap();
    let device = state
        .store
        .insert_device(NewDevice {
            device_uid: "d1".into(),
            home_id: home.id,
            room_id: None,
            device_type: "relay".into(),
            protocol: Protocol::Mqtt,
            hub_id: None,
            zigbee_ieee: None,
            lifecycle_status: LifecycleStatus::Bound,
            serial: Some("SER-1".into()),
            model_id: Some("relay-1".into()),
            bound_at: Some(Utc::now()),
        })
        .await
        .unwrap();
    state
        .store
        .put_state_current(DeviceStateCurrent {
            device_id: device.id,
            state: json!({}),
            last_seen: Utc::now(),
            online: true,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    (home.id, device)
}

async fn json_body(res: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn mqtt_relay_toggle_full_lifecycle() {
    let (router, state) = harness().await;
    let (home, device) = seed_mqtt_device(&state).await;

    let mut wire_sub = state.bus.subscribe("home/+/device/+/set").await.unwrap();
    let mut events = state.events.subscribe();

    // 1. submit over REST
    let res = router
        .oneshot(
            Request::post(format!("/devices/{}/command", device.id.0))
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"relay":true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body = json_body(res).await;
    let cmd_id = body["cmdId"].as_str().unwrap().to_string();
    assert_eq!(body["status"], "PENDING");

    // 2. the command envelope hit the device's set topic
    let published = timeout(Duration::from_secs(2), wire_sub.next())
        .await
        .unwrap()
        .expect("command published");
    assert_eq!(published.topic, format!("home/{}/device/d1/set", home.0));
    let msg: wire::CommandMsg = serde_json::from_slice(&published.payload).unwrap();
    assert_eq!(msg.cmd_id, cmd_id);
    assert_eq!(msg.payload, json!({"relay": true}));

    // 3. firmware acks on the ack topic
    let ack = json!({"cmdId": cmd_id, "ok": true, "ts": Utc::now().timestamp_millis()});
    state
        .bus
        .publish(
            &format!("home/{}/device/d1/ack", home.0),
            serde_json::to_vec(&ack).unwrap().into(),
            PublishOpts::command(),
        )
        .await
        .unwrap();

    // 4. the row resolves to ACKED
    timeout(Duration::from_secs(2), async {
        loop {
            let command =
                state.store.get_command_by_cmd_id(&cmd_id).await.unwrap().unwrap();
            if command.status == CommandStatus::Acked {
                assert!(command.acked_at.is_some());
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("command acked");

    // 5. the realtime stream saw PENDING then ACKED, in order
    sleep(Duration::from_millis(20)).await;
    let mut seen = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let StreamEvent::CommandUpdated { cmd_id: ev_cmd, status, .. } = ev.event {
            if ev_cmd == cmd_id {
                seen.push(status);
            }
        }
    }
    assert_eq!(seen, vec![CommandStatus::Pending, CommandStatus::Acked]);
}

#[tokio::test]
async fn zigbee_action_uses_the_zb_envelope() {
    let (router, state) = harness().await;
    let user = state.store.create_user("owner@example.com", "x", false).await.unwrap();
    let home = state.store.create_home("Home", user.id).await.unwrap();
    state
        .store
        .insert_hub_inventory(HubInventory {
            hub_id: "h1".into(),
            serial: None,
            model_id: "hub".into(),
            setup_code_hash: "x".into(),
            mqtt_secret_hash: None,
            status: InventoryStatus::Claimed,
            claimed_by_user_id: Some(user.id),
            claimed_home_id: Some(home.id),
            claimed_at: Some(Utc::now()),
            failed_attempts: 0,
            last_failed_at: None,
        })
        .await
        .unwrap();
    state
        .store
        .upsert_hub(Hub {
            hub_id: "h1".into(),
            home_id: home.id,
            firmware_version: None,
            online: true,
            last_seen: Some(Utc::now()),
        })
        .await
        .unwrap();
    let device = state
        .store
        .insert_device(NewDevice {
            device_uid: Uuid::new_v4().to_string(),
            home_id: home.id,
            room_id: None,
            device_type: "gate".into(),
            protocol: Protocol::Zigbee,
            hub_id: Some("h1".into()),
            zigbee_ieee: Some("00124b0001abcd12".into()),
            lifecycle_status: LifecycleStatus::Bound,
            serial: None,
            model_id: Some("gate-1".into()),
            bound_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    let mut wire_sub = state.bus.subscribe("home/zb/+/set").await.unwrap();
    let res = router
        .oneshot(
            Request::post(format!("/devices/{}/command", device.id.0))
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"action":"gate.open","params":{"source":"mobile"}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let published = timeout(Duration::from_secs(2), wire_sub.next())
        .await
        .unwrap()
        .expect("zigbee command published");
    assert_eq!(published.topic, "home/zb/00124b0001abcd12/set");
    let msg: wire::ZbCommandMsg = serde_json::from_slice(&published.payload).unwrap();
    assert_eq!(msg.action, "gate.open");
    assert_eq!(msg.args, json!({"source": "mobile"}));
}

#[tokio::test(start_paused = true)]
async fn timeout_then_retry_creates_a_fresh_row() {
    let (router, state) = harness().await;
    let (_, device) = seed_mqtt_device(&state).await;

    let res = router
        .clone()
        .oneshot(
            Request::post(format!("/devices/{}/command", device.id.0))
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"relay":true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let cmd_id = json_body(res).await["cmdId"].as_str().unwrap().to_string();

    // nobody acks; the 8s deadline fires
    tokio::time::advance(Duration::from_secs(9)).await;
    timeout(Duration::from_secs(2), async {
        loop {
            let command =
                state.store.get_command_by_cmd_id(&cmd_id).await.unwrap().unwrap();
            if command.status == CommandStatus::Timeout {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("command timed out");

    // retry mints a new cmdId with the same payload
    let res = router
        .oneshot(
            Request::post(format!("/admin/commands/{cmd_id}/retry"))
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let retried = json_body(res).await;
    assert_ne!(retried["cmd_id"], cmd_id);
    assert_eq!(retried["status"], "PENDING");
    assert_eq!(retried["payload"], json!({"relay": true}));
}
