//! Telemetry ingest: one worker per semantic channel, decoding the wire
//! payloads and feeding storage, presence, the orchestrator and the pairing
//! coordinator. Malformed messages are counted, logged and dropped; they
//! never block a channel.

mod ack;
mod discovered;
mod event;
mod state;
mod status;

use crate::state::AppState;

pub fn spawn_all(app: AppState) {
    state::spawn(app.clone());
    status::spawn(app.clone());
    event::spawn(app.clone());
    ack::spawn(app.clone());
    discovered::spawn(app.clone());
    spawn_resolution_router(app);
}

/// Routes terminal command resolutions to the control loops that care:
/// rollouts, rule deployment and inventory resets.
fn spawn_resolution_router(app: AppState) {
    let mut rx = app.commands.resolutions();
    tokio::spawn(async move {
        while let Ok(resolution) = rx.recv().await {
            if let Err(e) = app.rollouts.on_resolution(&resolution).await {
                tracing::warn!("rollout resolution failed: {e}");
            }
            if let Err(e) = app.automations.on_resolution(&resolution).await {
                tracing::warn!("automation resolution failed: {e}");
            }
            if let Err(e) = app.inventory.on_resolution(&resolution).await {
                tracing::warn!("inventory resolution failed: {e}");
            }
        }
    });
}
