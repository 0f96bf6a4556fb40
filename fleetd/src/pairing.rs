//! Zigbee pairing sessions: permit-join windows on a hub, fingerprint
//! capture from `zigbee/discovered`, and confirm-bind into a live Device.
//! Session tokens are unguessable and short-lived; the hub's permit-join is
//! closed when the session ends, confirmed or not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use fleet_core::{
    command::{CommandOrchestrator, HubCommand},
    error::{CoreError, CoreResult, ErrorKind},
    model::{
        Device, DiscoveredStatus, InventoryStatus, LifecycleStatus, PairingMode, Protocol, User,
        ZigbeeDiscoveredDevice, ZigbeePairingSession,
    },
    storage::{NewDevice, Storage},
    wire::DiscoveredMsg,
};

pub struct PairingCoordinator {
    store: Arc<dyn Storage>,
    commands: Arc<CommandOrchestrator>,
    window: Duration,
    sessions: Mutex<HashMap<Uuid, ZigbeePairingSession>>,
}

impl PairingCoordinator {
    pub fn new(
        store: Arc<dyn Storage>,
        commands: Arc<CommandOrchestrator>,
        window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { store, commands, window, sessions: Mutex::new(HashMap::new()) })
    }

    pub async fn open_session(
        &self,
        user: &User,
        hub_id: &str,
        mode: PairingMode,
        expected_model_id: Option<String>,
        claimed_serial: Option<String>,
    ) -> CoreResult<ZigbeePairingSession> {
        let hub = self
            .store
            .get_hub(hub_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("hub {hub_id}")))?;
        let home = self
            .store
            .get_home(hub.home_id)
            .await?
            .ok_or_else(|| CoreError::internal("hub without home"))?;
        if home.owner_user_id != user.id && !user.is_admin {
            return Err(CoreError::new(ErrorKind::Forbidden, "not your hub"));
        }

        match mode {
            PairingMode::SerialFirst => {
                let serial = claimed_serial
                    .as_deref()
                    .ok_or_else(|| CoreError::validation("SERIAL_FIRST needs claimedSerial"))?;
                let inventory = self
                    .store
                    .get_device_inventory(serial)
                    .await?
                    .ok_or_else(|| CoreError::not_found(format!("inventory {serial}")))?;
                if inventory.status != InventoryStatus::Claimed {
                    return Err(CoreError::precondition("serial must be claimed first"));
                }
                if inventory.protocol != Protocol::Zigbee {
                    return Err(CoreError::validation("serial is not a zigbee device"));
                }
            }
            PairingMode::TypeFirst => {
                if expected_model_id.is_none() {
                    return Err(CoreError::validation("TYPE_FIRST needs expectedModelId"));
                }
            }
            PairingMode::Legacy => {}
        }

        let now = Utc::now();
        let session = ZigbeePairingSession {
            token: Uuid::new_v4(),
            owner_user_id: user.id,
            hub_id: hub.hub_id.clone(),
            home_id: Some(hub.home_id),
            mode,
            claimed_serial,
            expected_model_id,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(60)),
        };

        self.commands
            .submit_hub_command(
                &hub.hub_id,
                HubCommand::PermitJoin {
                    open: true,
                    duration_s: self.window.as_secs() as u32,
                    token: session.token,
                },
                false,
            )
            .await?;

        self.sessions.lock().unwrap().insert(session.token, session.clone());
        Ok(session)
    }

    /// A hub saw a device join. Filters by session mode; SERIAL_FIRST
    /// auto-binds the first matching announce.
    pub async fn handle_discovered(&self, hub_id: &str, msg: DiscoveredMsg) -> Result<()> {
        let Some(session) = self.active_session_for_hub(hub_id) else {
            tracing::debug!(hub = hub_id, ieee = %msg.ieee, "discovered without an open session");
            return Ok(());
        };

        let status = match (&session.mode, &session.expected_model_id) {
            (PairingMode::TypeFirst, Some(expected)) => {
                if msg.model.as_deref() == Some(expected.as_str()) {
                    DiscoveredStatus::Pending
                } else {
                    DiscoveredStatus::Rejected
                }
            }
            _ => DiscoveredStatus::Pending,
        };

        let row = ZigbeeDiscoveredDevice {
            hub_id: hub_id.to_string(),
            ieee: msg.ieee.clone(),
            short_addr: msg.short_addr.clone(),
            manufacturer: msg.manufacturer.clone(),
            model: msg.model.clone(),
            sw_build_id: msg.sw_build_id.clone(),
            suggested_model_id: msg.model.clone(),
            pairing_token: session.token,
            status,
            updated_at: Utc::now(),
        };
        self.store.upsert_discovered(row).await?;

        if session.mode == PairingMode::SerialFirst && status == DiscoveredStatus::Pending {
            let serial = session.claimed_serial.as_deref().unwrap_or_default();
            if let Some(inventory) = self.store.get_device_inventory(serial).await?
                && msg.model.as_deref() == Some(inventory.model_id.as_str())
            {
                match self.bind(&session, &msg.ieee, None).await {
                    Ok(device) => {
                        tracing::info!(
                            device = device.id.0,
                            ieee = %msg.ieee,
                            "serial-first auto-bind"
                        );
                    }
                    Err(e) => tracing::warn!(ieee = %msg.ieee, "auto-bind failed: {e}"),
                }
            }
        }
        Ok(())
    }

    pub async fn confirm(
        &self,
        user: &User,
        token: Uuid,
        ieee: &str,
        model_id_override: Option<String>,
    ) -> CoreResult<Device> {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&token).cloned()
        }
        .ok_or_else(|| CoreError::not_found("pairing session"))?;
        if session.expires_at < Utc::now() {
            return Err(CoreError::precondition("pairing session expired"));
        }
        if session.owner_user_id != user.id && !user.is_admin {
            return Err(CoreError::new(ErrorKind::Forbidden, "not your pairing session"));
        }
        let device = self.bind(&session, ieee, model_id_override).await?;
        self.close_session(token).await;
        Ok(device)
    }

    async fn bind(
        &self,
        session: &ZigbeePairingSession,
        ieee: &str,
        model_id_override: Option<String>,
    ) -> CoreResult<Device> {
        let discovered = self
            .store
            .get_discovered(&session.hub_id, ieee)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("no discovered device {ieee}")))?;
        if discovered.status == DiscoveredStatus::Confirmed {
            return Err(CoreError::conflict("device already confirmed"));
        }
        if self.store.get_device_by_ieee(ieee).await?.is_some() {
            return Err(CoreError::conflict("ieee already bound"));
        }
        let home_id =
            session.home_id.ok_or_else(|| CoreError::internal("session without home"))?;

        let model_id = model_id_override
            .or_else(|| discovered.suggested_model_id.clone())
            .or_else(|| discovered.model.clone());

        // a SERIAL_FIRST claim parked a CLAIMING device we can finish binding
        let claiming = match session.claimed_serial.as_deref() {
            Some(serial) => self
                .store
                .get_device_by_serial(serial)
                .await?
                .filter(|d| d.lifecycle_status == LifecycleStatus::Claiming),
            None => None,
        };

        let device = match claiming {
            Some(device) => {
                self.store
                    .bind_zigbee_device(device.id, ieee, &session.hub_id, Utc::now())
                    .await?;
                self.store
                    .get_device(device.id)
                    .await?
                    .ok_or_else(|| CoreError::internal("bound device vanished"))?
            }
            None => {
                self.store
                    .insert_device(NewDevice {
                        device_uid: Uuid::new_v4().to_string(),
                        home_id,
                        room_id: None,
                        device_type: model_id.clone().unwrap_or_else(|| "zigbee".to_string()),
                        protocol: Protocol::Zigbee,
                        hub_id: Some(session.hub_id.clone()),
                        zigbee_ieee: Some(ieee.to_string()),
                        lifecycle_status: LifecycleStatus::Bound,
                        serial: None,
                        model_id,
                        bound_at: Some(Utc::now()),
                    })
                    .await?
            }
        };

        self.store
            .set_discovered_status(&session.hub_id, ieee, DiscoveredStatus::Confirmed)
            .await?;
        Ok(device)
    }

    /// Expires stale sessions and closes their permit-join windows.
    pub async fn expire_sessions(&self) {
        let expired: Vec<Uuid> = {
            let sessions = self.sessions.lock().unwrap();
            let now = Utc::now();
            sessions.values().filter(|s| s.expires_at < now).map(|s| s.token).collect()
        };
        for token in expired {
            self.close_session(token).await;
        }
    }

    async fn close_session(&self, token: Uuid) {
        let Some(session) = self.sessions.lock().unwrap().remove(&token) else {
            return;
        };
        let result = self
            .commands
            .submit_hub_command(
                &session.hub_id,
                HubCommand::PermitJoin { open: false, duration_s: 0, token },
                false,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(hub = %session.hub_id, "closing permit-join failed: {e}");
        }
    }

    pub fn spawn_expirer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                this.expire_sessions().await;
            }
        });
    }

    fn active_session_for_hub(&self, hub_id: &str) -> Option<ZigbeePairingSession> {
        let sessions = self.sessions.lock().unwrap();
        let now = Utc::now();
        sessions
            .values()
            .filter(|s| s.hub_id == hub_id && s.expires_at >= now)
            .max_by_key(|s| s.created_at)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::bus::{Bus, InMemoryBus};
    use fleet_core::command::CommandTimeouts;
    use fleet_core::fanout::EventHub;
    use fleet_core::model::{Hub, HubInventory};
    use fleet_core::storage::InMemoryStorage;
    use fleet_core::wire;
    use tokio_stream::StreamExt;

    struct Fixture {
        store: InMemoryStorage,
        bus: InMemoryBus,
        pairing: Arc<PairingCoordinator>,
        user: User,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let orch = CommandOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            EventHub::shared(),
            CommandTimeouts::default(),
        );
        let pairing = PairingCoordinator::new(
            Arc::new(store.clone()),
            orch,
            Duration::from_secs(60),
        );

        let user = store.create_user("owner@example.com", "x", false).await.unwrap();
        let home = store.create_home("Home", user.id).await.unwrap();
        store
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
        store
            .upsert_hub(Hub {
                hub_id: "h1".into(),
                home_id: home.id,
                firmware_version: None,
                online: true,
                last_seen: Some(Utc::now()),
            })
            .await
            .unwrap();

        Fixture { store, bus, pairing, user }
    }

    fn announce(ieee: &str, model: &str) -> DiscoveredMsg {
        DiscoveredMsg {
            ieee: ieee.into(),
            short_addr: Some("0x1a2b".into()),
            manufacturer: Some("Acme".into()),
            model: Some(model.into()),
            sw_build_id: Some("20240101".into()),
            ts: Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn legacy_flow_discovers_then_confirms() {
        let f = fixture().await;
        let mut set_sub = f.bus.subscribe(&wire::hub_set_topic("h1")).await.unwrap();

        let session = f
            .pairing
            .open_session(&f.user, "h1", PairingMode::Legacy, None, None)
            .await
            .unwrap();

        // permit-join open went to the hub
        let published = set_sub.next().await.expect("permit join open");
        let msg: wire::CommandMsg = serde_json::from_slice(&published.payload).unwrap();
        assert_eq!(msg.payload.get("cmd").and_then(|v| v.as_str()), Some("permit_join"));
        assert_eq!(msg.payload.get("open").and_then(|v| v.as_bool()), Some(true));

        f.pairing.handle_discovered("h1", announce("00124b0001abcd12", "gate-1")).await.unwrap();
        let discovered = f.store.get_discovered("h1", "00124b0001abcd12").await.unwrap().unwrap();
        assert_eq!(discovered.status, DiscoveredStatus::Pending);
        assert_eq!(discovered.pairing_token, session.token);

        let device = f
            .pairing
            .confirm(&f.user, session.token, "00124b0001abcd12", None)
            .await
            .unwrap();
        assert_eq!(device.lifecycle_status, LifecycleStatus::Bound);
        assert_eq!(device.zigbee_ieee.as_deref(), Some("00124b0001abcd12"));
        assert_eq!(device.hub_id.as_deref(), Some("h1"));

        // session is gone and permit-join was closed
        let closed = set_sub.next().await.expect("permit join close");
        let msg: wire::CommandMsg = serde_json::from_slice(&closed.payload).unwrap();
        assert_eq!(msg.payload.get("open").and_then(|v| v.as_bool()), Some(false));
        let err = f
            .pairing
            .confirm(&f.user, session.token, "00124b0001abcd12", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn type_first_rejects_wrong_fingerprint() {
        let f = fixture().await;
        let session = f
            .pairing
            .open_session(&f.user, "h1", PairingMode::TypeFirst, Some("gate-1".into()), None)
            .await
            .unwrap();

        f.pairing.handle_discovered("h1", announce("aaaa", "other-model")).await.unwrap();
        f.pairing.handle_discovered("h1", announce("bbbb", "gate-1")).await.unwrap();

        assert_eq!(
            f.store.get_discovered("h1", "aaaa").await.unwrap().unwrap().status,
            DiscoveredStatus::Rejected
        );
        assert_eq!(
            f.store.get_discovered("h1", "bbbb").await.unwrap().unwrap().status,
            DiscoveredStatus::Pending
        );
        drop(session);
    }

    #[tokio::test]
    async fn serial_first_auto_binds_matching_model() {
        let f = fixture().await;
        // a prior inventory claim parked a CLAIMING device
        f.store
            .insert_device_inventory(fleet_core::model::DeviceInventory {
                serial: "ZB-1".into(),
                device_uid: Uuid::new_v4(),
                type_default: "gate".into(),
                protocol: Protocol::Zigbee,
                model_id: "gate-1".into(),
                setup_code_hash: "x".into(),
                mqtt_secret_hash: None,
                status: InventoryStatus::Claimed,
                claimed_by_user_id: Some(f.user.id),
                claimed_home_id: Some(fleet_core::model::HomeId(1)),
                claimed_at: Some(Utc::now()),
                failed_attempts: 0,
                last_failed_at: None,
            })
            .await
            .unwrap();
        f.store
            .insert_device(NewDevice {
                device_uid: Uuid::new_v4().to_string(),
                home_id: fleet_core::model::HomeId(1),
                room_id: None,
                device_type: "gate".into(),
                protocol: Protocol::Zigbee,
                hub_id: None,
                zigbee_ieee: None,
                lifecycle_status: LifecycleStatus::Claiming,
                serial: Some("ZB-1".into()),
                model_id: Some("gate-1".into()),
                bound_at: None,
            })
            .await
            .unwrap();

        f.pairing
            .open_session(&f.user, "h1", PairingMode::SerialFirst, None, Some("ZB-1".into()))
            .await
            .unwrap();

        // wrong model joins first: stored but not bound
        f.pairing.handle_discovered("h1", announce("aaaa", "lamp-9")).await.unwrap();
        assert!(f.store.get_device_by_ieee("aaaa").await.unwrap().is_none());

        // matching model auto-binds the claiming device
        f.pairing.handle_discovered("h1", announce("bbbb", "gate-1")).await.unwrap();
        let device = f.store.get_device_by_ieee("bbbb").await.unwrap().unwrap();
        assert_eq!(device.lifecycle_status, LifecycleStatus::Bound);
        assert_eq!(device.serial.as_deref(), Some("ZB-1"));
        assert_eq!(device.hub_id.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn expired_sessions_stop_accepting_confirms() {
        let f = fixture().await;
        let session = f
            .pairing
            .open_session(&f.user, "h1", PairingMode::Legacy, None, None)
            .await
            .unwrap();
        f.pairing.handle_discovered("h1", announce("cccc", "gate-1")).await.unwrap();

        // force-expire
        {
            let mut sessions = f.pairing.sessions.lock().unwrap();
            sessions.get_mut(&session.token).unwrap().expires_at =
                Utc::now() - chrono::Duration::seconds(1);
        }
        let err =
            f.pairing.confirm(&f.user, session.token, "cccc", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);

        f.pairing.expire_sessions().await;
        assert!(f.pairing.sessions.lock().unwrap().is_empty());
    }
}
