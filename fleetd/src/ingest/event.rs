use fleet_core::{
    bus::Bus,
    fanout::StreamEvent,
    storage::Storage,
    wire::{self, Channel, ZbEventMsg},
};
use metrics::counter;
use tokio_stream::StreamExt;

use crate::state::AppState;

pub fn spawn(app: AppState) {
    tokio::spawn(async move {
        let Ok(mut stream) = app.bus.subscribe("home/zb/+/event").await else {
            tracing::error!("subscribing zb event channel failed");
            return;
        };
        while let Some(msg) = stream.next().await {
            let Some(Channel::ZbEvent { ieee }) = Channel::parse(&msg.topic) else {
                continue;
            };
            let device = match app.store.get_device_by_ieee(&ieee).await {
                Ok(Some(device)) => device,
                Ok(None) => {
                    counter!("ingest.event.unknown_device").increment(1);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("device lookup failed: {e}");
                    continue;
                }
            };
            let parsed = match serde_json::from_slice::<ZbEventMsg>(&msg.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    counter!("ingest.event.decode_error").increment(1);
                    tracing::warn!(topic = %msg.topic, "bad event payload: {e}");
                    continue;
                }
            };
            let Some(home_id) = device.home_id else {
                continue;
            };
            match app
                .store
                .append_device_event(
                    device.id,
                    home_id,
                    &parsed.event_type,
                    parsed.data,
                    wire::from_epoch_ms(parsed.ts),
                )
                .await
            {
                Ok(event) => {
                    app.events.publish(
                        home_id,
                        StreamEvent::DeviceEventCreated { device_db_id: device.id, event },
                    );
                }
                Err(e) => {
                    counter!("ingest.event.handle_error").increment(1);
                    tracing::warn!(device = device.id.0, "event append failed: {e}");
                }
            }
        }
    });
}
