use std::sync::Arc;

use anyhow::Result;
use automations::AutomationEngine;
use fleet_core::{
    bus::{Bus, InMemoryBus},
    command::{CommandOrchestrator, CommandTimeouts},
    fanout::EventHub,
    inventory::InventoryRegistry,
    keyed::KeyedMutex,
    storage::{InMemoryStorage, PostgresStorage, Storage},
};
use tokio::time::Duration;
use transport_mqtt::MqttBus;

use crate::{
    config::{BusKind, Config, StorageKind},
    pairing::PairingCoordinator,
    presence::{PresenceConfig, PresenceTracker},
    rollout::RolloutEngine,
    state::AppState,
};

pub async fn build_state(cfg: &Config) -> Result<AppState> {
    let bus: Arc<dyn Bus> = match cfg.bus {
        BusKind::InMem => Arc::new(InMemoryBus::default()),
        BusKind::Mqtt => {
            Arc::new(MqttBus::connect(&cfg.mqtt.host, cfg.mqtt.port, &cfg.mqtt.client_id).await?)
        }
    };

    let store: Arc<dyn Storage> = match cfg.storage {
        StorageKind::InMem => Arc::new(InMemoryStorage::default()),
        StorageKind::Postgres => {
            let Some(url) = cfg.database_url.as_ref() else {
                anyhow::bail!("FLEETD_DATABASE_URL is required for postgres storage");
            };
            Arc::new(PostgresStorage::connect(url).await?)
        }
    };

    let events = EventHub::shared();
    let commands = CommandOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&events),
        CommandTimeouts { ack: cfg.command_timeout, ..CommandTimeouts::default() },
    );
    let inventory = Arc::new(InventoryRegistry::new(Arc::clone(&store), Arc::clone(&commands)));
    let automations = AutomationEngine::new(Arc::clone(&store), Arc::clone(&commands));
    let presence = PresenceTracker::new(
        Arc::clone(&store),
        Arc::clone(&events),
        Arc::clone(&commands),
        Arc::clone(&automations),
        PresenceConfig {
            device_offline_after: cfg.device_offline_after,
            hub_offline_after: cfg.hub_offline_after,
            ..PresenceConfig::default()
        },
    );
    let rollouts = RolloutEngine::new(Arc::clone(&store), Arc::clone(&commands));
    let pairing =
        PairingCoordinator::new(Arc::clone(&store), Arc::clone(&commands), cfg.pairing_window);

    Ok(AppState {
        store,
        bus,
        events,
        commands,
        inventory,
        automations,
        presence,
        rollouts,
        pairing,
        auth: cfg.auth.clone(),
        state_locks: Arc::new(KeyedMutex::default()),
    })
}

/// Starts every long-lived worker: deadline scheduler, ingest consumers,
/// presence sweeper, rollout and deployment reconcilers, pairing expirer.
pub async fn spawn_workers(app: &AppState) -> Result<()> {
    app.commands.recover().await?;
    app.commands.spawn_scheduler();
    crate::ingest::spawn_all(app.clone());
    app.presence.spawn_sweeper();
    app.rollouts.spawn_reconciler(Duration::from_secs(5));
    app.automations.spawn_reconciler(Duration::from_secs(5));
    app.pairing.spawn_expirer();
    Ok(())
}
