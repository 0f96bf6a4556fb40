use std::sync::Arc;

use automations::AutomationEngine;
use fleet_core::{
    bus::Bus, command::CommandOrchestrator, fanout::EventHub, inventory::InventoryRegistry,
    keyed::KeyedMutex, storage::Storage,
};

use crate::{config::AuthConfig, pairing::PairingCoordinator, presence::PresenceTracker, rollout::RolloutEngine};

/// Process-wide services handle. Everything is reached through this, never
/// through ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Storage>,
    pub bus: Arc<dyn Bus>,
    pub events: Arc<EventHub>,
    pub commands: Arc<CommandOrchestrator>,
    pub inventory: Arc<InventoryRegistry>,
    pub automations: Arc<AutomationEngine>,
    pub presence: Arc<PresenceTracker>,
    pub rollouts: Arc<RolloutEngine>,
    pub pairing: Arc<PairingCoordinator>,
    pub auth: AuthConfig,
    /// Serializes state ingestion per device id.
    pub state_locks: Arc<KeyedMutex<i64>>,
}
