//! Identity & inventory registry: factory-provisioned hubs and devices with
//! hashed setup codes, one-shot plaintext on creation, claim/reset lifecycle.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{CommandInput, CommandOrchestrator, CommandResolution};
use crate::error::{CoreError, CoreResult};
use crate::model::{
    Command, CommandStatus, Device, DeviceInventory, Hub, HubInventory, InventoryStatus,
    LifecycleStatus, Protocol, ResetKind, ResetStatus, RoomId, User,
};
use crate::secrets;
use crate::storage::{NewDevice, Storage};

const MAX_FAILED_CLAIMS: i32 = 5;
const CLAIM_LOCKOUT_MINUTES: i64 = 15;

#[derive(Debug, Clone, Deserialize)]
pub struct NewHubItem {
    pub hub_id: String,
    #[serde(default)]
    pub serial: Option<String>,
    pub model_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDeviceItem {
    pub serial: String,
    pub type_default: String,
    pub protocol: Protocol,
    pub model_id: String,
}

/// Creation response. The only place the setup code ever appears in
/// plaintext; it cannot be re-derived afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedItem {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_uid: Option<Uuid>,
    pub setup_code: String,
    pub qr_payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkError {
    pub index: usize,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub created: Vec<CreatedItem>,
    pub errors: Vec<BulkError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubClaim {
    pub hub: Hub,
    /// One-shot MQTT credential for the hub firmware.
    pub mqtt_secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceClaim {
    pub device: Device,
    pub mqtt_secret: String,
}

pub struct InventoryRegistry {
    store: Arc<dyn Storage>,
    orchestrator: Arc<CommandOrchestrator>,
}

impl InventoryRegistry {
    pub fn new(store: Arc<dyn Storage>, orchestrator: Arc<CommandOrchestrator>) -> Self {
        Self { store, orchestrator }
    }

    pub async fn create_hub_item(&self, item: NewHubItem) -> CoreResult<CreatedItem> {
        if item.hub_id.trim().is_empty() {
            return Err(CoreError::validation("hubId must not be empty"));
        }
        let setup_code = secrets::generate_setup_code();
        let row = HubInventory {
            hub_id: item.hub_id.clone(),
            serial: item.serial,
            model_id: item.model_id,
            setup_code_hash: secrets::hash_secret(&setup_code).map_err(CoreError::internal)?,
            mqtt_secret_hash: None,
            status: InventoryStatus::FactoryNew,
            claimed_by_user_id: None,
            claimed_home_id: None,
            claimed_at: None,
            failed_attempts: 0,
            last_failed_at: None,
        };
        self.store.insert_hub_inventory(row).await?;
        Ok(CreatedItem {
            qr_payload: secrets::qr_payload("hub", &item.hub_id, &setup_code),
            id: item.hub_id,
            device_uid: None,
            setup_code,
        })
    }

    pub async fn create_device_item(&self, item: NewDeviceItem) -> CoreResult<CreatedItem> {
        if item.serial.trim().is_empty() {
            return Err(CoreError::validation("serial must not be empty"));
        }
        let setup_code = secrets::generate_setup_code();
        let device_uid = Uuid::new_v4();
        let row = DeviceInventory {
            serial: item.serial.clone(),
            device_uid,
            type_default: item.type_default,
            protocol: item.protocol,
            model_id: item.model_id,
            setup_code_hash: secrets::hash_secret(&setup_code).map_err(CoreError::internal)?,
            mqtt_secret_hash: None,
            status: InventoryStatus::FactoryNew,
            claimed_by_user_id: None,
            claimed_home_id: None,
            claimed_at: None,
            failed_attempts: 0,
            last_failed_at: None,
        };
        self.store.insert_device_inventory(row).await?;
        Ok(CreatedItem {
            qr_payload: secrets::qr_payload("device", &item.serial, &setup_code),
            id: item.serial,
            device_uid: Some(device_uid),
            setup_code,
        })
    }

    /// Atomic per item: a bad row is reported and skipped, the rest land.
    pub async fn bulk_create_devices(&self, items: Vec<NewDeviceItem>) -> BulkOutcome {
        let mut outcome = BulkOutcome { created: Vec::new(), errors: Vec::new() };
        for (index, item) in items.into_iter().enumerate() {
            let id = item.serial.clone();
            match self.create_device_item(item).await {
                Ok(created) => outcome.created.push(created),
                Err(e) => outcome.errors.push(BulkError { index, id, error: e.to_string() }),
            }
        }
        outcome
    }

    pub async fn bulk_create_hubs(&self, items: Vec<NewHubItem>) -> BulkOutcome {
        let mut outcome = BulkOutcome { created: Vec::new(), errors: Vec::new() };
        for (index, item) in items.into_iter().enumerate() {
            let id = item.hub_id.clone();
            match self.create_hub_item(item).await {
                Ok(created) => outcome.created.push(created),
                Err(e) => outcome.errors.push(BulkError { index, id, error: e.to_string() }),
            }
        }
        outcome
    }

    pub async fn claim_hub(
        &self,
        user: &User,
        hub_id: &str,
        setup_code: &str,
        home_id: crate::model::HomeId,
    ) -> CoreResult<HubClaim> {
        let row = self
            .store
            .get_hub_inventory(hub_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("hub {hub_id}")))?;

        self.check_rate_limit(row.failed_attempts, row.last_failed_at)?;
        if !secrets::verify_secret(setup_code, &row.setup_code_hash) {
            self.store.record_hub_claim_failure(hub_id, Utc::now()).await?;
            return Err(CoreError::auth_failed("invalid setup code"));
        }
        if row.status != InventoryStatus::FactoryNew {
            return Err(CoreError::conflict("hub already claimed"));
        }
        self.check_home_access(user, home_id).await?;

        let mqtt_secret = secrets::generate_mqtt_secret();
        let secret_hash = secrets::hash_secret(&mqtt_secret).map_err(CoreError::internal)?;
        let applied = self
            .store
            .claim_hub_inventory(hub_id, user.id, home_id, &secret_hash, Utc::now())
            .await?;
        if !applied {
            return Err(CoreError::conflict("hub already claimed"));
        }

        let hub = Hub {
            hub_id: hub_id.to_string(),
            home_id,
            firmware_version: None,
            online: false,
            last_seen: None,
        };
        self.store.upsert_hub(hub.clone()).await?;
        Ok(HubClaim { hub, mqtt_secret })
    }

    pub async fn claim_device(
        &self,
        user: &User,
        serial: &str,
        setup_code: &str,
        home_id: crate::model::HomeId,
        room_id: Option<RoomId>,
    ) -> CoreResult<DeviceClaim> {
        let row = self
            .store
            .get_device_inventory(serial)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("device {serial}")))?;

        self.check_rate_limit(row.failed_attempts, row.last_failed_at)?;
        if !secrets::verify_secret(setup_code, &row.setup_code_hash) {
            self.store.record_device_claim_failure(serial, Utc::now()).await?;
            return Err(CoreError::auth_failed("invalid setup code"));
        }
        if row.status != InventoryStatus::FactoryNew {
            return Err(CoreError::conflict("device already claimed"));
        }
        self.check_home_access(user, home_id).await?;
        if let Some(room) = room_id {
            let room_row = self
                .store
                .get_room(room)
                .await?
                .ok_or_else(|| CoreError::validation("room does not exist"))?;
            if room_row.home_id != home_id {
                return Err(CoreError::validation("room belongs to another home"));
            }
        }

        // a reset that is still in flight blocks re-claiming
        if let Some(previous) = self.store.get_device_by_serial(serial).await?
            && self.store.pending_reset_for_device(previous.id).await?.is_some()
        {
            return Err(CoreError::precondition("a reset is still pending for this device"));
        }

        let mqtt_secret = secrets::generate_mqtt_secret();
        let secret_hash = secrets::hash_secret(&mqtt_secret).map_err(CoreError::internal)?;
        let applied = self
            .store
            .claim_device_inventory(serial, user.id, home_id, &secret_hash, Utc::now())
            .await?;
        if !applied {
            return Err(CoreError::conflict("device already claimed"));
        }

        let previous = match row.protocol {
            Protocol::Mqtt => self.store.get_device_by_uid(&row.device_uid.to_string()).await?,
            // zigbee identities are generated per bind, so match on serial
            Protocol::Zigbee => None,
        };
        let device = match previous {
            // factory-reset devices come back with their identity intact
            Some(previous) if previous.lifecycle_status == LifecycleStatus::Unbound => {
                self.store.rebind_device(previous.id, home_id, room_id, Utc::now()).await?;
                self.store
                    .get_device(previous.id)
                    .await?
                    .ok_or_else(|| CoreError::internal("rebound device vanished"))?
            }
            Some(_) => return Err(CoreError::conflict("deviceId already in use")),
            None => {
                let (device_uid, lifecycle, bound_at) = match row.protocol {
                    Protocol::Mqtt => {
                        (row.device_uid.to_string(), LifecycleStatus::Bound, Some(Utc::now()))
                    }
                    // zigbee devices only reach BOUND through pairing
                    Protocol::Zigbee => {
                        (Uuid::new_v4().to_string(), LifecycleStatus::Claiming, None)
                    }
                };
                self.store
                    .insert_device(NewDevice {
                        device_uid,
                        home_id,
                        room_id,
                        device_type: row.type_default.clone(),
                        protocol: row.protocol,
                        hub_id: None,
                        zigbee_ieee: None,
                        lifecycle_status: lifecycle,
                        serial: Some(serial.to_string()),
                        model_id: Some(row.model_id.clone()),
                        bound_at,
                    })
                    .await?
            }
        };

        Ok(DeviceClaim { device, mqtt_secret })
    }

    /// Records a reset request and pushes the management command through the
    /// orchestrator. Factory resets are deliverable while offline.
    pub async fn revoke(&self, device_id: crate::model::DeviceId, kind: ResetKind) -> CoreResult<Command> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("device {}", device_id.0)))?;
        if self.store.pending_reset_for_device(device.id).await?.is_some() {
            return Err(CoreError::conflict("a reset is already pending"));
        }

        let input = match device.protocol {
            Protocol::Mqtt => CommandInput::Payload(serde_json::json!({
                "mgmt": match kind {
                    ResetKind::Reconnect => "RECONNECT",
                    ResetKind::FactoryReset => "FACTORY_RESET",
                }
            })),
            Protocol::Zigbee => CommandInput::Action {
                action: match kind {
                    ResetKind::Reconnect => "mgmt.reconnect".to_string(),
                    ResetKind::FactoryReset => "mgmt.factory_reset".to_string(),
                },
                params: serde_json::Value::Null,
            },
        };
        let offline_allowed = kind == ResetKind::FactoryReset;
        let command =
            self.orchestrator.submit_device_command(device.id, input, offline_allowed).await?;
        self.store.insert_reset_request(device.id, kind, &command.cmd_id).await?;
        Ok(command)
    }

    /// Follows up on resolved management commands. An ACKed factory reset
    /// unbinds the device and releases its inventory row for re-claim.
    pub async fn on_resolution(&self, resolution: &CommandResolution) -> anyhow::Result<()> {
        let command = &resolution.command;
        let outcome = match command.status {
            CommandStatus::Acked => ResetStatus::Done,
            CommandStatus::Failed | CommandStatus::Timeout => ResetStatus::Failed,
            CommandStatus::Pending => return Ok(()),
        };
        let Some(request) = self.store.resolve_reset_request(&command.cmd_id, outcome).await?
        else {
            return Ok(());
        };
        if request.kind == ResetKind::FactoryReset && outcome == ResetStatus::Done {
            let Some(device) = self.store.get_device(request.device_id).await? else {
                return Ok(());
            };
            self.store.unbind_device(device.id, Utc::now()).await?;
            if let Some(serial) = device.serial.as_deref() {
                self.store.release_device_inventory(serial).await?;
            }
            tracing::info!(device = device.id.0, "factory reset completed, inventory released");
        }
        Ok(())
    }

    fn check_rate_limit(
        &self,
        failed_attempts: i32,
        last_failed_at: Option<chrono::DateTime<Utc>>,
    ) -> CoreResult<()> {
        let in_window = last_failed_at
            .map(|at| Utc::now() - at < ChronoDuration::minutes(CLAIM_LOCKOUT_MINUTES))
            .unwrap_or(false);
        if failed_attempts >= MAX_FAILED_CLAIMS && in_window {
            return Err(CoreError::auth_failed("too many failed attempts, try again later"));
        }
        Ok(())
    }

    async fn check_home_access(&self, user: &User, home_id: crate::model::HomeId) -> CoreResult<()> {
        let home = self
            .store
            .get_home(home_id)
            .await?
            .ok_or_else(|| CoreError::validation("home does not exist"))?;
        if home.owner_user_id != user.id && !user.is_admin {
            return Err(CoreError::new(crate::error::ErrorKind::Forbidden, "not your home"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::command::CommandTimeouts;
    use crate::error::ErrorKind;
    use crate::fanout::EventHub;
    use crate::model::{HomeId, UserId};
    use crate::storage::InMemoryStorage;

    async fn registry(store: &InMemoryStorage) -> (InventoryRegistry, Arc<CommandOrchestrator>) {
        let bus = InMemoryBus::default();
        let orch = CommandOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(bus),
            EventHub::shared(),
            CommandTimeouts::default(),
        );
        (InventoryRegistry::new(Arc::new(store.clone()), Arc::clone(&orch)), orch)
    }

    async fn admin(store: &InMemoryStorage) -> User {
        store.create_user("ops@example.com", "x", true).await.unwrap()
    }

    #[tokio::test]
    async fn setup_code_is_one_shot_and_hashed() {
        let store = InMemoryStorage::default();
        let (registry, _) = registry(&store).await;

        let created = registry
            .create_device_item(NewDeviceItem {
                serial: "SER-1".into(),
                type_default: "relay".into(),
                protocol: Protocol::Mqtt,
                model_id: "m1".into(),
            })
            .await
            .unwrap();

        let row = store.get_device_inventory("SER-1").await.unwrap().unwrap();
        assert_ne!(row.setup_code_hash, created.setup_code);
        assert!(secrets::verify_secret(&created.setup_code, &row.setup_code_hash));
        assert!(created.qr_payload.contains(&created.setup_code));
        // serializing the stored row never leaks the hash
        let as_json = serde_json::to_value(&row).unwrap();
        assert!(as_json.get("setup_code_hash").is_none());
    }

    #[tokio::test]
    async fn claim_binds_then_conflicts_on_repeat() {
        let store = InMemoryStorage::default();
        let (registry, _) = registry(&store).await;
        let user = admin(&store).await;
        let home = store.create_home("Home", user.id).await.unwrap();

        let created = registry
            .create_device_item(NewDeviceItem {
                serial: "SER-1".into(),
                type_default: "relay".into(),
                protocol: Protocol::Mqtt,
                model_id: "m1".into(),
            })
            .await
            .unwrap();

        let claim = registry
            .claim_device(&user, "SER-1", &created.setup_code, home.id, None)
            .await
            .unwrap();
        assert_eq!(claim.device.lifecycle_status, LifecycleStatus::Bound);
        assert_eq!(claim.device.device_uid, created.device_uid.unwrap().to_string());
        assert!(!claim.mqtt_secret.is_empty());

        // the correct code no longer helps once claimed
        let err = registry
            .claim_device(&user, "SER-1", &created.setup_code, home.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn wrong_code_fails_and_rate_limits() {
        let store = InMemoryStorage::default();
        let (registry, _) = registry(&store).await;
        let user = admin(&store).await;
        let home = store.create_home("Home", user.id).await.unwrap();

        registry
            .create_device_item(NewDeviceItem {
                serial: "SER-1".into(),
                type_default: "relay".into(),
                protocol: Protocol::Mqtt,
                model_id: "m1".into(),
            })
            .await
            .unwrap();

        for _ in 0..5 {
            let err = registry
                .claim_device(&user, "SER-1", "WRONG", home.id, None)
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::AuthFailed);
        }
        // locked out even with junk codes; the row itself is untouched
        let err =
            registry.claim_device(&user, "SER-1", "WRONG", home.id, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthFailed);
        assert!(err.message.contains("too many"));
    }

    #[tokio::test]
    async fn factory_reset_releases_inventory_for_reclaim() {
        let store = InMemoryStorage::default();
        let (registry, orch) = registry(&store).await;
        let user = admin(&store).await;
        let home_a = store.create_home("A", user.id).await.unwrap();
        let home_b = store.create_home("B", user.id).await.unwrap();

        let created = registry
            .create_device_item(NewDeviceItem {
                serial: "SER-1".into(),
                type_default: "relay".into(),
                protocol: Protocol::Mqtt,
                model_id: "m1".into(),
            })
            .await
            .unwrap();
        let claim = registry
            .claim_device(&user, "SER-1", &created.setup_code, home_a.id, None)
            .await
            .unwrap();

        let command =
            registry.revoke(claim.device.id, ResetKind::FactoryReset).await.unwrap();
        let resolved = orch.handle_ack(&command.cmd_id, true, None, None).await.unwrap().unwrap();
        registry
            .on_resolution(&CommandResolution { command: resolved, applied_version: None })
            .await
            .unwrap();

        let device = store.get_device(claim.device.id).await.unwrap().unwrap();
        assert_eq!(device.lifecycle_status, LifecycleStatus::Unbound);
        assert_eq!(device.home_id, None);
        let row = store.get_device_inventory("SER-1").await.unwrap().unwrap();
        assert_eq!(row.status, InventoryStatus::FactoryNew);

        // same identity, new home
        let reclaimed = registry
            .claim_device(&user, "SER-1", &created.setup_code, home_b.id, None)
            .await
            .unwrap();
        assert_eq!(reclaimed.device.id, claim.device.id);
        assert_eq!(reclaimed.device.home_id, Some(home_b.id));
        assert_eq!(reclaimed.device.lifecycle_status, LifecycleStatus::Bound);
    }

    #[tokio::test]
    async fn hub_claim_round_trip() {
        let store = InMemoryStorage::default();
        let (registry, _) = registry(&store).await;
        let user = admin(&store).await;
        let home = store.create_home("Home", user.id).await.unwrap();

        let created = registry
            .create_hub_item(NewHubItem {
                hub_id: "h1".into(),
                serial: None,
                model_id: "hub-m1".into(),
            })
            .await
            .unwrap();
        let claim =
            registry.claim_hub(&user, "h1", &created.setup_code, home.id).await.unwrap();
        assert_eq!(claim.hub.home_id, home.id);
        assert!(!claim.hub.online);
        assert!(store.get_hub("h1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bulk_create_reports_per_row_errors() {
        let store = InMemoryStorage::default();
        let (registry, _) = registry(&store).await;

        let outcome = registry
            .bulk_create_devices(vec![
                NewDeviceItem {
                    serial: "SER-1".into(),
                    type_default: "relay".into(),
                    protocol: Protocol::Mqtt,
                    model_id: "m1".into(),
                },
                NewDeviceItem {
                    serial: "SER-1".into(), // duplicate
                    type_default: "relay".into(),
                    protocol: Protocol::Mqtt,
                    model_id: "m1".into(),
                },
                NewDeviceItem {
                    serial: "SER-2".into(),
                    type_default: "sensor".into(),
                    protocol: Protocol::Zigbee,
                    model_id: "m2".into(),
                },
            ])
            .await;

        assert_eq!(outcome.created.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);
        assert_eq!(outcome.errors[0].id, "SER-1");
    }

    #[tokio::test]
    async fn zigbee_claim_parks_device_in_claiming() {
        let store = InMemoryStorage::default();
        let (registry, _) = registry(&store).await;
        let user = admin(&store).await;
        let home = store.create_home("Home", user.id).await.unwrap();

        let created = registry
            .create_device_item(NewDeviceItem {
                serial: "ZB-1".into(),
                type_default: "gate".into(),
                protocol: Protocol::Zigbee,
                model_id: "gate-1".into(),
            })
            .await
            .unwrap();
        let claim = registry
            .claim_device(&user, "ZB-1", &created.setup_code, home.id, None)
            .await
            .unwrap();
        assert_eq!(claim.device.lifecycle_status, LifecycleStatus::Claiming);
        assert_eq!(claim.device.hub_id, None);
        // zigbee identities are generated, not the inventory uuid
        assert_ne!(claim.device.device_uid, created.device_uid.unwrap().to_string());
    }
}
