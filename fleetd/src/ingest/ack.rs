use fleet_core::bus::Bus;
use fleet_core::wire::{AckMsg, Channel};
use metrics::counter;
use tokio_stream::StreamExt;

use crate::state::AppState;

pub fn spawn(app: AppState) {
    for pattern in ["home/+/device/+/ack", "home/hub/+/ack", "home/zb/+/cmd_result"] {
        let app = app.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = app.bus.subscribe(pattern).await else {
                tracing::error!("subscribing {pattern} failed");
                return;
            };
            while let Some(msg) = stream.next().await {
                if !matches!(
                    Channel::parse(&msg.topic),
                    Some(
                        Channel::DeviceAck { .. } | Channel::HubAck { .. } | Channel::ZbCmdResult { .. }
                    )
                ) {
                    continue;
                }
                let parsed = match serde_json::from_slice::<AckMsg>(&msg.payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        counter!("ingest.ack.decode_error").increment(1);
                        tracing::warn!(topic = %msg.topic, "bad ack payload: {e}");
                        continue;
                    }
                };
                match app
                    .commands
                    .handle_ack(&parsed.cmd_id, parsed.ok, parsed.error, parsed.applied_version)
                    .await
                {
                    Ok(Some(_)) => counter!("ingest.ack.resolved").increment(1),
                    Ok(None) => counter!("ingest.ack.unmatched").increment(1),
                    Err(e) => {
                        counter!("ingest.ack.handle_error").increment(1);
                        tracing::warn!(cmd_id = %parsed.cmd_id, "ack handling failed: {e}");
                    }
                }
            }
        });
    }
}
