//! Presence: derives online/offline for devices and hubs from status
//! messages and time-since-last-seen, and emits transition events only --
//! repeats and stale retained replays are swallowed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use automations::AutomationEngine;
use chrono::{DateTime, Utc};
use fleet_core::{
    command::CommandOrchestrator,
    fanout::{EventHub, StreamEvent},
    model::{CommandTarget, Device, DeviceStateCurrent, Hub},
    storage::Storage,
    wire,
};

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub device_offline_after: Duration,
    pub hub_offline_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            device_offline_after: Duration::from_secs(90),
            hub_offline_after: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum Key {
    Device(i64),
    Hub(String),
}

struct Entry {
    online: bool,
    last_msg_ts: i64,
    last_seen: DateTime<Utc>,
}

pub struct PresenceTracker {
    store: Arc<dyn Storage>,
    events: Arc<EventHub>,
    commands: Arc<CommandOrchestrator>,
    automations: Arc<AutomationEngine>,
    cfg: PresenceConfig,
    entries: Mutex<HashMap<Key, Entry>>,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn Storage>,
        events: Arc<EventHub>,
        commands: Arc<CommandOrchestrator>,
        automations: Arc<AutomationEngine>,
        cfg: PresenceConfig,
    ) -> Arc<Self> {
        Arc::new(Self { store, events, commands, automations, cfg, entries: Mutex::new(HashMap::new()) })
    }

    /// Explicit status message from a device (including its LWT).
    pub async fn handle_device_status(&self, device: &Device, ts_ms: i64, online: bool) {
        let key = Key::Device(device.id.0);
        let last_seen = wire::from_epoch_ms(ts_ms);
        let Some(transition) = self.apply(key, ts_ms, last_seen, online) else {
            return;
        };
        self.persist_device_online(device, online, last_seen).await;
        if transition {
            self.emit_device(device, online, last_seen);
            if online {
                self.commands.flush_queued(&CommandTarget::Device(device.id)).await;
            }
        }
    }

    /// Any state traffic proves the device is alive.
    pub async fn handle_device_activity(&self, device: &Device, ts_ms: i64) {
        let key = Key::Device(device.id.0);
        let last_seen = wire::from_epoch_ms(ts_ms);
        let Some(transition) = self.apply(key, ts_ms, last_seen, true) else {
            return;
        };
        if transition {
            self.persist_device_online(device, true, last_seen).await;
            self.emit_device(device, true, last_seen);
            self.commands.flush_queued(&CommandTarget::Device(device.id)).await;
        }
    }

    pub async fn handle_hub_status(&self, hub: &Hub, ts_ms: i64, online: bool) {
        let key = Key::Hub(hub.hub_id.clone());
        let last_seen = wire::from_epoch_ms(ts_ms);
        let Some(transition) = self.apply_with_prior(key, ts_ms, last_seen, online, hub.online)
        else {
            return;
        };
        if let Err(e) = self.store.set_hub_presence(&hub.hub_id, online, last_seen).await {
            tracing::warn!(hub = %hub.hub_id, "persisting hub presence failed: {e}");
        }
        if transition {
            self.events.publish(
                hub.home_id,
                StreamEvent::HubStatusChanged { hub_id: hub.hub_id.clone(), online, last_seen },
            );
            if online {
                self.commands.flush_queued(&CommandTarget::Hub(hub.hub_id.clone())).await;
                self.automations.on_hub_online(&hub.hub_id);
            }
        }
    }

    /// Flips silent targets offline. Runs on a timer; emits like any other
    /// transition.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let stale: Vec<Key> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(key, entry)| {
                    let cutoff = match key {
                        Key::Device(_) => self.cfg.device_offline_after,
                        Key::Hub(_) => self.cfg.hub_offline_after,
                    };
                    entry.online
                        && (now - entry.last_seen).to_std().unwrap_or(Duration::ZERO) > cutoff
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in stale {
            {
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(&key) {
                    entry.online = false;
                }
            }
            match key {
                Key::Device(id) => {
                    let device = match self.store.get_device(fleet_core::model::DeviceId(id)).await
                    {
                        Ok(Some(device)) => device,
                        _ => continue,
                    };
                    self.persist_device_online(&device, false, now).await;
                    self.emit_device(&device, false, now);
                }
                Key::Hub(hub_id) => {
                    let hub = match self.store.get_hub(&hub_id).await {
                        Ok(Some(hub)) => hub,
                        _ => continue,
                    };
                    if let Err(e) = self.store.set_hub_presence(&hub_id, false, now).await {
                        tracing::warn!(hub = %hub_id, "persisting hub presence failed: {e}");
                    }
                    self.events.publish(
                        hub.home_id,
                        StreamEvent::HubStatusChanged { hub_id, online: false, last_seen: now },
                    );
                }
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.cfg.sweep_interval);
            loop {
                ticker.tick().await;
                this.sweep().await;
            }
        });
    }

    /// Updates the tracked entry. Returns None when the message is a stale
    /// replay, Some(transition) otherwise.
    fn apply(
        &self,
        key: Key,
        ts_ms: i64,
        last_seen: DateTime<Utc>,
        online: bool,
    ) -> Option<bool> {
        self.apply_with_prior(key, ts_ms, last_seen, online, false)
    }

    fn apply_with_prior(
        &self,
        key: Key,
        ts_ms: i64,
        last_seen: DateTime<Utc>,
        online: bool,
        fallback_prior: bool,
    ) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&key) {
            Some(entry) => {
                // a later-timestamped message always wins; older replays lose
                if ts_ms < entry.last_msg_ts {
                    return None;
                }
                let transition = entry.online != online;
                entry.online = online;
                entry.last_msg_ts = ts_ms;
                entry.last_seen = last_seen;
                Some(transition)
            }
            None => {
                entries.insert(key, Entry { online, last_msg_ts: ts_ms, last_seen });
                Some(fallback_prior != online)
            }
        }
    }

    async fn persist_device_online(&self, device: &Device, online: bool, last_seen: DateTime<Utc>) {
        let row = match self.store.get_state_current(device.id).await {
            Ok(Some(mut current)) => {
                current.online = online;
                current.updated_at = Utc::now();
                if last_seen > current.last_seen {
                    current.last_seen = last_seen;
                }
                current
            }
            Ok(None) => DeviceStateCurrent {
                device_id: device.id,
                state: serde_json::json!({}),
                last_seen,
                online,
                updated_at: Utc::now(),
            },
            Err(e) => {
                tracing::warn!(device = device.id.0, "loading state for presence failed: {e}");
                return;
            }
        };
        if let Err(e) = self.store.put_state_current(row).await {
            tracing::warn!(device = device.id.0, "persisting presence failed: {e}");
        }
    }

    fn emit_device(&self, device: &Device, online: bool, last_seen: DateTime<Utc>) {
        let Some(home_id) = device.home_id else {
            return;
        };
        self.events.publish(
            home_id,
            StreamEvent::DeviceStatusChanged { device_db_id: device.id, online, last_seen },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::bus::InMemoryBus;
    use fleet_core::command::CommandTimeouts;
    use fleet_core::model::{LifecycleStatus, Protocol, UserId};
    use fleet_core::storage::{InMemoryStorage, NewDevice};

    async fn fixture() -> (InMemoryStorage, Arc<EventHub>, Arc<PresenceTracker>, Device) {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let events = EventHub::shared();
        let orch = CommandOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(bus),
            Arc::clone(&events),
            CommandTimeouts::default(),
        );
        let automations = AutomationEngine::new(Arc::new(store.clone()), Arc::clone(&orch));
        let presence = PresenceTracker::new(
            Arc::new(store.clone()),
            Arc::clone(&events),
            orch,
            automations,
            PresenceConfig::default(),
        );
        let home = store.create_home("Home", UserId(1)).await.unwrap();
        let device = store
            .insert_device(NewDevice {
                device_uid: "d1".into(),
                home_id: home.id,
                room_id: None,
                device_type: "relay".into(),
                protocol: Protocol::Mqtt,
                hub_id: None,
                zigbee_ieee: None,
                lifecycle_status: LifecycleStatus::Bound,
                serial: None,
                model_id: None,
                bound_at: Some(Utc::now()),
            })
            .await
            .unwrap();
        (store, events, presence, device)
    }

    #[tokio::test]
    async fn transitions_emit_once() {
        let (store, events, presence, device) = fixture().await;
        let mut rx = events.subscribe();

        presence.handle_device_status(&device, 1_000, true).await;
        presence.handle_device_status(&device, 2_000, true).await; // repeat, no event
        presence.handle_device_status(&device, 3_000, false).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.event,
            StreamEvent::DeviceStatusChanged { online: true, .. }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.event,
            StreamEvent::DeviceStatusChanged { online: false, .. }
        ));
        assert!(rx.try_recv().is_err());

        let state = store.get_state_current(device.id).await.unwrap().unwrap();
        assert!(!state.online);
    }

    #[tokio::test]
    async fn stale_retained_replay_is_ignored() {
        let (store, _events, presence, device) = fixture().await;

        presence.handle_device_status(&device, 5_000, false).await;
        // a retained "online" from before the disconnect replays late
        presence.handle_device_status(&device, 1_000, true).await;

        let state = store.get_state_current(device.id).await.unwrap().unwrap();
        assert!(!state.online);
    }

    #[tokio::test]
    async fn state_traffic_marks_online() {
        let (store, _events, presence, device) = fixture().await;
        presence.handle_device_status(&device, 1_000, false).await;
        presence.handle_device_activity(&device, 2_000).await;
        let state = store.get_state_current(device.id).await.unwrap().unwrap();
        assert!(state.online);
    }

    #[tokio::test]
    async fn sweep_flips_silent_devices_offline() {
        let (store, events, presence, device) = fixture().await;
        let old = (Utc::now() - chrono::Duration::seconds(300)).timestamp_millis();
        presence.handle_device_status(&device, old, true).await;

        let mut rx = events.subscribe();
        presence.sweep().await;

        let got = rx.recv().await.unwrap();
        assert!(matches!(got.event, StreamEvent::DeviceStatusChanged { online: false, .. }));
        let state = store.get_state_current(device.id).await.unwrap().unwrap();
        assert!(!state.online);
    }
}
