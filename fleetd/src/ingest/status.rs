use fleet_core::bus::Bus;
use fleet_core::storage::Storage;
use fleet_core::wire::{Channel, StatusMsg};
use metrics::counter;
use tokio_stream::StreamExt;

use crate::state::AppState;

pub fn spawn(app: AppState) {
    for pattern in ["home/+/device/+/status", "home/hub/+/status"] {
        let app = app.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = app.bus.subscribe(pattern).await else {
                tracing::error!("subscribing {pattern} failed");
                return;
            };
            while let Some(msg) = stream.next().await {
                let parsed = match serde_json::from_slice::<StatusMsg>(&msg.payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        counter!("ingest.status.decode_error").increment(1);
                        tracing::warn!(topic = %msg.topic, "bad status payload: {e}");
                        continue;
                    }
                };
                match Channel::parse(&msg.topic) {
                    Some(Channel::DeviceStatus { device_uid, .. }) => {
                        match app.store.get_device_by_uid(&device_uid).await {
                            Ok(Some(device)) => {
                                app.presence
                                    .handle_device_status(&device, parsed.ts, parsed.online)
                                    .await;
                            }
                            Ok(None) => counter!("ingest.status.unknown_device").increment(1),
                            Err(e) => tracing::warn!("device lookup failed: {e}"),
                        }
                    }
                    Some(Channel::HubStatus { hub_id }) => {
                        match app.store.get_hub(&hub_id).await {
                            Ok(Some(hub)) => {
                                app.presence
                                    .handle_hub_status(&hub, parsed.ts, parsed.online)
                                    .await;
                                if let Some(version) = parsed.fw_version.as_deref() {
                                    if let Err(e) =
                                        app.store.set_hub_firmware(&hub_id, version).await
                                    {
                                        tracing::warn!(hub = %hub_id, "firmware save failed: {e}");
                                    }
                                    if let Err(e) =
                                        app.rollouts.on_hub_firmware(&hub_id, version).await
                                    {
                                        tracing::warn!(hub = %hub_id, "rollout report failed: {e}");
                                    }
                                }
                            }
                            Ok(None) => counter!("ingest.status.unknown_hub").increment(1),
                            Err(e) => tracing::warn!("hub lookup failed: {e}"),
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}
