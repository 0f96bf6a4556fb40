use chrono::Utc;
use fleet_core::{
    bus::Bus,
    fanout::StreamEvent,
    model::{Device, DeviceStateCurrent, DeviceStateHistoryRow},
    storage::Storage,
    wire::{self, Channel, StateMsg},
};
use metrics::counter;
use tokio_stream::StreamExt;

use crate::state::AppState;

pub fn spawn(app: AppState) {
    for pattern in ["home/+/device/+/state", "home/zb/+/state"] {
        let app = app.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = app.bus.subscribe(pattern).await else {
                tracing::error!("subscribing {pattern} failed");
                return;
            };
            while let Some(msg) = stream.next().await {
                let device = match Channel::parse(&msg.topic) {
                    Some(Channel::DeviceState { device_uid, .. }) => {
                        app.store.get_device_by_uid(&device_uid).await
                    }
                    Some(Channel::ZbState { ieee }) => app.store.get_device_by_ieee(&ieee).await,
                    _ => continue,
                };
                let device = match device {
                    Ok(Some(device)) => device,
                    Ok(None) => {
                        counter!("ingest.state.unknown_device").increment(1);
                        continue;
                    }
                    Err(e) => {
                        counter!("ingest.state.lookup_error").increment(1);
                        tracing::warn!("device lookup failed: {e}");
                        continue;
                    }
                };
                let parsed = match serde_json::from_slice::<StateMsg>(&msg.payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        counter!("ingest.state.decode_error").increment(1);
                        tracing::warn!(topic = %msg.topic, "bad state payload: {e}");
                        continue;
                    }
                };
                if let Err(e) = apply_state(&app, &device, parsed).await {
                    counter!("ingest.state.handle_error").increment(1);
                    tracing::warn!(device = device.id.0, "state apply failed: {e}");
                }
            }
        });
    }
}

/// Applies one state message under the device's ingest lock: the snapshot
/// only moves forward in message time, history records everything.
pub async fn apply_state(app: &AppState, device: &Device, msg: StateMsg) -> anyhow::Result<()> {
    let last_seen = wire::from_epoch_ms(msg.ts);
    let _guard = app.state_locks.lock(device.id.0).await;

    let current = app.store.get_state_current(device.id).await?;
    let is_newer = current.as_ref().is_none_or(|c| last_seen > c.last_seen);

    app.store
        .append_state_history(DeviceStateHistoryRow {
            device_id: device.id,
            state: msg.state.clone(),
            online: true,
            last_seen,
            created_at: Utc::now(),
        })
        .await?;

    if is_newer {
        app.store
            .put_state_current(DeviceStateCurrent {
                device_id: device.id,
                state: msg.state.clone(),
                last_seen,
                online: true,
                updated_at: Utc::now(),
            })
            .await?;
        if let Some(home_id) = device.home_id {
            app.events.publish(
                home_id,
                StreamEvent::DeviceStateUpdated {
                    device_db_id: device.id,
                    device_id: device.device_uid.clone(),
                    state: msg.state,
                    last_seen,
                    online: Some(true),
                },
            );
        }
    }
    drop(_guard);

    app.presence.handle_device_activity(device, msg.ts).await;
    Ok(())
}
