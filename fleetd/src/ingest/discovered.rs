use fleet_core::bus::Bus;
use fleet_core::wire::{Channel, DiscoveredMsg};
use metrics::counter;
use tokio_stream::StreamExt;

use crate::state::AppState;

pub fn spawn(app: AppState) {
    tokio::spawn(async move {
        let Ok(mut stream) = app.bus.subscribe("home/hub/+/zigbee/discovered").await else {
            tracing::error!("subscribing discovered channel failed");
            return;
        };
        while let Some(msg) = stream.next().await {
            let Some(Channel::ZbDiscovered { hub_id }) = Channel::parse(&msg.topic) else {
                continue;
            };
            let parsed = match serde_json::from_slice::<DiscoveredMsg>(&msg.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    counter!("ingest.discovered.decode_error").increment(1);
                    tracing::warn!(topic = %msg.topic, "bad discovered payload: {e}");
                    continue;
                }
            };
            if let Err(e) = app.pairing.handle_discovered(&hub_id, parsed).await {
                counter!("ingest.discovered.handle_error").increment(1);
                tracing::warn!(hub = %hub_id, "discovered handling failed: {e}");
            }
        }
    });
}
