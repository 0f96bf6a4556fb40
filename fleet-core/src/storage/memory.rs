use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    CommandFilter, DeviceFilter, EventFilter, NewCommand, NewDevice, NewRelease, NewRule, Storage,
};
use crate::error::CoreError;
use crate::model::*;

/// Test-grade storage with the same semantics as Postgres, including the
/// optimistic claim predicates and the PENDING transition guard.
#[derive(Default, Clone)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<i64, User>,
    sessions: HashMap<Uuid, Session>,
    homes: HashMap<i64, Home>,
    rooms: HashMap<i64, Room>,
    hub_inventory: HashMap<String, HubInventory>,
    device_inventory: HashMap<String, DeviceInventory>,
    hubs: HashMap<String, Hub>,
    devices: HashMap<i64, Device>,
    states: HashMap<i64, DeviceStateCurrent>,
    history: Vec<DeviceStateHistoryRow>,
    events: Vec<DeviceEvent>,
    commands: Vec<Command>,
    releases: HashMap<i64, FirmwareRelease>,
    rollouts: HashMap<i64, FirmwareRollout>,
    targets: Vec<RolloutTarget>,
    rules: HashMap<i64, AutomationRule>,
    deployments: HashMap<(String, i64), AutomationDeployment>,
    discovered: HashMap<(String, String), ZigbeeDiscoveredDevice>,
    resets: Vec<ResetRequest>,
    seq: Sequences,
}

#[derive(Default)]
struct Sequences {
    user: i64,
    home: i64,
    device: i64,
    event: i64,
    command: i64,
    release: i64,
    rollout: i64,
    rule: i64,
    reset: i64,
}

impl Sequences {
    fn next(field: &mut i64) -> i64 {
        *field += 1;
        *field
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_user(&self, email: &str, password_hash: &str, is_admin: bool) -> Result<User> {
        let mut g = self.inner.write().unwrap();
        if g.users.values().any(|u| u.email == email) {
            return Err(CoreError::conflict("email already registered").into());
        }
        let id = Sequences::next(&mut g.seq.user);
        let user = User {
            id: UserId(id),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            is_admin,
            created_at: Utc::now(),
        };
        g.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.read().unwrap().users.get(&id.0).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.inner.read().unwrap().users.values().find(|u| u.email == email).cloned())
    }

    async fn insert_session(&self, session: Session) -> Result<()> {
        self.inner.write().unwrap().sessions.insert(session.token, session);
        Ok(())
    }

    async fn get_session(&self, token: Uuid) -> Result<Option<Session>> {
        Ok(self.inner.read().unwrap().sessions.get(&token).cloned())
    }

    async fn create_home(&self, name: &str, owner: UserId) -> Result<Home> {
        let mut g = self.inner.write().unwrap();
        let id = Sequences::next(&mut g.seq.home);
        let home = Home { id: HomeId(id), name: name.to_string(), owner_user_id: owner };
        g.homes.insert(id, home.clone());
        Ok(home)
    }

    async fn get_home(&self, id: HomeId) -> Result<Option<Home>> {
        Ok(self.inner.read().unwrap().homes.get(&id.0).cloned())
    }

    async fn home_ids_for_user(&self, user: UserId) -> Result<Vec<HomeId>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .homes
            .values()
            .filter(|h| h.owner_user_id == user)
            .map(|h| h.id)
            .collect())
    }

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>> {
        Ok(self.inner.read().unwrap().rooms.get(&id.0).cloned())
    }

    async fn insert_hub_inventory(&self, row: HubInventory) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if g.hub_inventory.contains_key(&row.hub_id) {
            return Err(CoreError::conflict(format!("hub {} already exists", row.hub_id)).into());
        }
        g.hub_inventory.insert(row.hub_id.clone(), row);
        Ok(())
    }

    async fn get_hub_inventory(&self, hub_id: &str) -> Result<Option<HubInventory>> {
        Ok(self.inner.read().unwrap().hub_inventory.get(hub_id).cloned())
    }

    async fn list_hub_inventory(&self) -> Result<Vec<HubInventory>> {
        let mut list: Vec<_> = self.inner.read().unwrap().hub_inventory.values().cloned().collect();
        list.sort_by(|a, b| a.hub_id.cmp(&b.hub_id));
        Ok(list)
    }

    async fn claim_hub_inventory(
        &self,
        hub_id: &str,
        user: UserId,
        home: HomeId,
        mqtt_secret_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut g = self.inner.write().unwrap();
        let Some(row) = g.hub_inventory.get_mut(hub_id) else {
            return Ok(false);
        };
        if row.status != InventoryStatus::FactoryNew {
            return Ok(false);
        }
        row.status = InventoryStatus::Claimed;
        row.claimed_by_user_id = Some(user);
        row.claimed_home_id = Some(home);
        row.claimed_at = Some(at);
        row.mqtt_secret_hash = Some(mqtt_secret_hash.to_string());
        row.failed_attempts = 0;
        Ok(true)
    }

    async fn record_hub_claim_failure(&self, hub_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if let Some(row) = g.hub_inventory.get_mut(hub_id) {
            row.failed_attempts += 1;
            row.last_failed_at = Some(at);
        }
        Ok(())
    }

    async fn insert_device_inventory(&self, row: DeviceInventory) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if g.device_inventory.contains_key(&row.serial) {
            return Err(CoreError::conflict(format!("serial {} already exists", row.serial)).into());
        }
        g.device_inventory.insert(row.serial.clone(), row);
        Ok(())
    }

    async fn get_device_inventory(&self, serial: &str) -> Result<Option<DeviceInventory>> {
        Ok(self.inner.read().unwrap().device_inventory.get(serial).cloned())
    }

    async fn list_device_inventory(&self) -> Result<Vec<DeviceInventory>> {
        let mut list: Vec<_> =
            self.inner.read().unwrap().device_inventory.values().cloned().collect();
        list.sort_by(|a, b| a.serial.cmp(&b.serial));
        Ok(list)
    }

    async fn claim_device_inventory(
        &self,
        serial: &str,
        user: UserId,
        home: HomeId,
        mqtt_secret_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut g = self.inner.write().unwrap();
        let Some(row) = g.device_inventory.get_mut(serial) else {
            return Ok(false);
        };
        if row.status != InventoryStatus::FactoryNew {
            return Ok(false);
        }
        row.status = InventoryStatus::Claimed;
        row.claimed_by_user_id = Some(user);
        row.claimed_home_id = Some(home);
        row.claimed_at = Some(at);
        row.mqtt_secret_hash = Some(mqtt_secret_hash.to_string());
        row.failed_attempts = 0;
        Ok(true)
    }

    async fn record_device_claim_failure(&self, serial: &str, at: DateTime<Utc>) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if let Some(row) = g.device_inventory.get_mut(serial) {
            row.failed_attempts += 1;
            row.last_failed_at = Some(at);
        }
        Ok(())
    }

    async fn release_device_inventory(&self, serial: &str) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let Some(row) = g.device_inventory.get_mut(serial) else {
            return Err(CoreError::not_found(format!("inventory {serial}")).into());
        };
        row.status = InventoryStatus::FactoryNew;
        row.claimed_by_user_id = None;
        row.claimed_home_id = None;
        row.claimed_at = None;
        row.mqtt_secret_hash = None;
        Ok(())
    }

    async fn upsert_hub(&self, hub: Hub) -> Result<()> {
        self.inner.write().unwrap().hubs.insert(hub.hub_id.clone(), hub);
        Ok(())
    }

    async fn get_hub(&self, hub_id: &str) -> Result<Option<Hub>> {
        Ok(self.inner.read().unwrap().hubs.get(hub_id).cloned())
    }

    async fn list_hubs(&self, home_id: Option<HomeId>) -> Result<Vec<Hub>> {
        let mut list: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .hubs
            .values()
            .filter(|h| home_id.is_none_or(|id| h.home_id == id))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.hub_id.cmp(&b.hub_id));
        Ok(list)
    }

    async fn set_hub_presence(
        &self,
        hub_id: &str,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if let Some(hub) = g.hubs.get_mut(hub_id) {
            hub.online = online;
            hub.last_seen = Some(last_seen);
        }
        Ok(())
    }

    async fn set_hub_firmware(&self, hub_id: &str, version: &str) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if let Some(hub) = g.hubs.get_mut(hub_id) {
            hub.firmware_version = Some(version.to_string());
        }
        Ok(())
    }

    async fn insert_device(&self, new: NewDevice) -> Result<Device> {
        let mut g = self.inner.write().unwrap();
        if g.devices.values().any(|d| d.device_uid == new.device_uid) {
            return Err(CoreError::conflict("deviceId already in use").into());
        }
        let id = Sequences::next(&mut g.seq.device);
        let device = Device {
            id: DeviceId(id),
            device_uid: new.device_uid,
            home_id: Some(new.home_id),
            room_id: new.room_id,
            device_type: new.device_type,
            protocol: new.protocol,
            hub_id: new.hub_id,
            zigbee_ieee: new.zigbee_ieee,
            lifecycle_status: new.lifecycle_status,
            serial: new.serial,
            model_id: new.model_id,
            firmware_version: None,
            bound_at: new.bound_at,
            unbound_at: None,
        };
        g.devices.insert(id, device.clone());
        Ok(device)
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>> {
        Ok(self.inner.read().unwrap().devices.get(&id.0).cloned())
    }

    async fn get_device_by_uid(&self, device_uid: &str) -> Result<Option<Device>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .devices
            .values()
            .find(|d| d.device_uid == device_uid)
            .cloned())
    }

    async fn get_device_by_ieee(&self, ieee: &str) -> Result<Option<Device>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .devices
            .values()
            .find(|d| d.zigbee_ieee.as_deref() == Some(ieee))
            .cloned())
    }

    async fn get_device_by_serial(&self, serial: &str) -> Result<Option<Device>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .devices
            .values()
            .find(|d| d.serial.as_deref() == Some(serial))
            .cloned())
    }

    async fn list_devices(&self, filter: DeviceFilter) -> Result<Vec<Device>> {
        let g = self.inner.read().unwrap();
        let mut list: Vec<_> = g
            .devices
            .values()
            .filter(|d| filter.home_id.is_none_or(|h| d.home_id == Some(h)))
            .filter(|d| {
                filter.model_id.as_deref().is_none_or(|m| d.model_id.as_deref() == Some(m))
            })
            .filter(|d| {
                filter.online.is_none_or(|want| {
                    g.states.get(&d.id.0).map(|s| s.online).unwrap_or(false) == want
                })
            })
            .cloned()
            .collect();
        list.sort_by_key(|d| d.id.0);
        Ok(list)
    }

    async fn set_device_lifecycle(&self, id: DeviceId, status: LifecycleStatus) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let device = g.devices.get_mut(&id.0).ok_or_else(|| anyhow!("device not found"))?;
        device.lifecycle_status = status;
        Ok(())
    }

    async fn bind_zigbee_device(
        &self,
        id: DeviceId,
        ieee: &str,
        hub_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let device = g.devices.get_mut(&id.0).ok_or_else(|| anyhow!("device not found"))?;
        device.zigbee_ieee = Some(ieee.to_string());
        device.hub_id = Some(hub_id.to_string());
        device.lifecycle_status = LifecycleStatus::Bound;
        device.bound_at = Some(at);
        Ok(())
    }

    async fn unbind_device(&self, id: DeviceId, at: DateTime<Utc>) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let device = g.devices.get_mut(&id.0).ok_or_else(|| anyhow!("device not found"))?;
        device.lifecycle_status = LifecycleStatus::Unbound;
        device.unbound_at = Some(at);
        device.home_id = None;
        device.room_id = None;
        Ok(())
    }

    async fn rebind_device(
        &self,
        id: DeviceId,
        home: HomeId,
        room: Option<RoomId>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let device = g.devices.get_mut(&id.0).ok_or_else(|| anyhow!("device not found"))?;
        device.home_id = Some(home);
        device.room_id = room;
        device.lifecycle_status = LifecycleStatus::Bound;
        device.bound_at = Some(at);
        device.unbound_at = None;
        Ok(())
    }

    async fn set_device_firmware(&self, id: DeviceId, version: &str) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if let Some(device) = g.devices.get_mut(&id.0) {
            device.firmware_version = Some(version.to_string());
        }
        Ok(())
    }

    async fn get_state_current(&self, device: DeviceId) -> Result<Option<DeviceStateCurrent>> {
        Ok(self.inner.read().unwrap().states.get(&device.0).cloned())
    }

    async fn put_state_current(&self, row: DeviceStateCurrent) -> Result<()> {
        self.inner.write().unwrap().states.insert(row.device_id.0, row);
        Ok(())
    }

    async fn append_state_history(&self, row: DeviceStateHistoryRow) -> Result<()> {
        self.inner.write().unwrap().history.push(row);
        Ok(())
    }

    async fn state_history(
        &self,
        device: DeviceId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<DeviceStateHistoryRow>> {
        let g = self.inner.read().unwrap();
        let mut list: Vec<_> = g
            .history
            .iter()
            .filter(|r| r.device_id == device)
            .filter(|r| since.is_none_or(|s| r.created_at >= s))
            .cloned()
            .collect();
        list.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        list.truncate(limit);
        Ok(list)
    }

    async fn append_device_event(
        &self,
        device: DeviceId,
        home: HomeId,
        event_type: &str,
        data: serde_json::Value,
        source_at: DateTime<Utc>,
    ) -> Result<DeviceEvent> {
        let mut g = self.inner.write().unwrap();
        let id = Sequences::next(&mut g.seq.event);
        let event = DeviceEvent {
            id,
            device_id: device,
            home_id: home,
            event_type: event_type.to_string(),
            data,
            source_at,
            created_at: Utc::now(),
        };
        g.events.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, filter: EventFilter) -> Result<Vec<DeviceEvent>> {
        let g = self.inner.read().unwrap();
        let mut list: Vec<_> = g
            .events
            .iter()
            .filter(|e| filter.home_id.is_none_or(|h| e.home_id == h))
            .filter(|e| filter.device_id.is_none_or(|d| e.device_id == d))
            .filter(|e| filter.date.is_none_or(|d| e.created_at.date_naive() == d))
            .filter(|e| filter.event_type.as_deref().is_none_or(|t| e.event_type == t))
            .cloned()
            .collect();
        list.sort_by_key(|e| std::cmp::Reverse(e.id));
        if filter.limit > 0 {
            list.truncate(filter.limit);
        }
        Ok(list)
    }

    async fn insert_command(&self, new: NewCommand) -> Result<Command> {
        let mut g = self.inner.write().unwrap();
        if g.commands.iter().any(|c| c.target == new.target && c.cmd_id == new.cmd_id) {
            return Err(CoreError::conflict("duplicate cmdId for target").into());
        }
        let id = Sequences::next(&mut g.seq.command);
        let command = Command {
            id,
            target: new.target,
            home_id: new.home_id,
            cmd_id: new.cmd_id,
            payload: new.payload,
            status: CommandStatus::Pending,
            sent_at: new.sent_at,
            acked_at: None,
            error: None,
        };
        g.commands.push(command.clone());
        Ok(command)
    }

    async fn get_command(&self, id: i64) -> Result<Option<Command>> {
        Ok(self.inner.read().unwrap().commands.iter().find(|c| c.id == id).cloned())
    }

    async fn get_command_by_cmd_id(&self, cmd_id: &str) -> Result<Option<Command>> {
        Ok(self.inner.read().unwrap().commands.iter().find(|c| c.cmd_id == cmd_id).cloned())
    }

    async fn transition_command(
        &self,
        cmd_id: &str,
        to: CommandStatus,
        acked_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<Option<Command>> {
        let mut g = self.inner.write().unwrap();
        let Some(command) = g
            .commands
            .iter_mut()
            .find(|c| c.cmd_id == cmd_id && c.status == CommandStatus::Pending)
        else {
            return Ok(None);
        };
        command.status = to;
        command.acked_at = acked_at;
        command.error = error;
        Ok(Some(command.clone()))
    }

    async fn list_commands(&self, filter: CommandFilter) -> Result<Vec<Command>> {
        let g = self.inner.read().unwrap();
        let mut list: Vec<_> = g
            .commands
            .iter()
            .filter(|c| filter.status.is_none_or(|s| c.status == s))
            .filter(|c| {
                filter.device_id.is_none_or(|d| c.target == CommandTarget::Device(d))
            })
            .filter(|c| filter.date.is_none_or(|d| c.sent_at.date_naive() == d))
            .cloned()
            .collect();
        list.sort_by_key(|c| std::cmp::Reverse(c.sent_at));
        if filter.limit > 0 {
            list.truncate(filter.limit);
        }
        Ok(list)
    }

    async fn list_pending_commands(&self) -> Result<Vec<Command>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.status == CommandStatus::Pending)
            .cloned()
            .collect())
    }

    async fn insert_release(&self, new: NewRelease) -> Result<FirmwareRelease> {
        let mut g = self.inner.write().unwrap();
        let id = Sequences::next(&mut g.seq.release);
        let release = FirmwareRelease {
            id,
            target_type: new.target_type,
            version: new.version,
            url: new.url,
            sha256: new.sha256,
            size: new.size,
            notes: new.notes,
            created_at: Utc::now(),
        };
        g.releases.insert(id, release.clone());
        Ok(release)
    }

    async fn get_release(&self, id: i64) -> Result<Option<FirmwareRelease>> {
        Ok(self.inner.read().unwrap().releases.get(&id).cloned())
    }

    async fn list_releases(&self) -> Result<Vec<FirmwareRelease>> {
        let mut list: Vec<_> = self.inner.read().unwrap().releases.values().cloned().collect();
        list.sort_by_key(|r| std::cmp::Reverse(r.id));
        Ok(list)
    }

    async fn create_rollout(
        &self,
        release_id: i64,
        hub_ids: Vec<String>,
    ) -> Result<FirmwareRollout> {
        let mut g = self.inner.write().unwrap();
        if !g.releases.contains_key(&release_id) {
            return Err(CoreError::not_found("release not found").into());
        }
        let id = Sequences::next(&mut g.seq.rollout);
        let now = Utc::now();
        let rollout = FirmwareRollout {
            id,
            release_id,
            status: RolloutStatus::Created,
            created_at: now,
            updated_at: now,
        };
        g.rollouts.insert(id, rollout.clone());
        for hub_id in hub_ids {
            g.targets.push(RolloutTarget {
                rollout_id: id,
                hub_id,
                state: TargetState::Created,
                attempt: 0,
                cmd_id: None,
                sent_at: None,
                acked_at: None,
                last_msg: None,
                next_attempt_at: None,
            });
        }
        Ok(rollout)
    }

    async fn get_rollout(&self, id: i64) -> Result<Option<FirmwareRollout>> {
        Ok(self.inner.read().unwrap().rollouts.get(&id).cloned())
    }

    async fn list_rollouts(&self) -> Result<Vec<FirmwareRollout>> {
        let mut list: Vec<_> = self.inner.read().unwrap().rollouts.values().cloned().collect();
        list.sort_by_key(|r| std::cmp::Reverse(r.id));
        Ok(list)
    }

    async fn set_rollout_status(&self, id: i64, status: RolloutStatus) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let rollout = g.rollouts.get_mut(&id).ok_or_else(|| anyhow!("rollout not found"))?;
        rollout.status = status;
        rollout.updated_at = Utc::now();
        Ok(())
    }

    async fn list_rollout_targets(&self, rollout_id: i64) -> Result<Vec<RolloutTarget>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .targets
            .iter()
            .filter(|t| t.rollout_id == rollout_id)
            .cloned()
            .collect())
    }

    async fn update_rollout_target(&self, target: RolloutTarget) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let Some(slot) = g
            .targets
            .iter_mut()
            .find(|t| t.rollout_id == target.rollout_id && t.hub_id == target.hub_id)
        else {
            return Err(anyhow!("rollout target not found"));
        };
        *slot = target;
        Ok(())
    }

    async fn find_target_by_cmd(&self, cmd_id: &str) -> Result<Option<RolloutTarget>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .targets
            .iter()
            .find(|t| t.cmd_id.as_deref() == Some(cmd_id))
            .cloned())
    }

    async fn insert_rule(&self, new: NewRule) -> Result<AutomationRule> {
        let mut g = self.inner.write().unwrap();
        let id = Sequences::next(&mut g.seq.rule);
        let now = Utc::now();
        let rule = AutomationRule {
            id,
            home_id: new.home_id,
            name: new.name,
            enabled: new.enabled,
            version: new.version,
            trigger_type: new.trigger_type,
            trigger: new.trigger,
            actions: new.actions,
            execution_policy: new.execution_policy,
            created_at: now,
            updated_at: now,
        };
        g.rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: AutomationRule) -> Result<AutomationRule> {
        let mut g = self.inner.write().unwrap();
        if !g.rules.contains_key(&rule.id) {
            return Err(CoreError::not_found("rule not found").into());
        }
        let mut updated = rule;
        updated.updated_at = Utc::now();
        g.rules.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_rule(&self, id: i64) -> Result<Option<AutomationRule>> {
        Ok(self.inner.write().unwrap().rules.remove(&id))
    }

    async fn get_rule(&self, id: i64) -> Result<Option<AutomationRule>> {
        Ok(self.inner.read().unwrap().rules.get(&id).cloned())
    }

    async fn list_rules(&self, home_id: HomeId) -> Result<Vec<AutomationRule>> {
        let mut list: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .rules
            .values()
            .filter(|r| r.home_id == home_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.id);
        Ok(list)
    }

    async fn upsert_deployment(&self, dep: AutomationDeployment) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .deployments
            .insert((dep.hub_id.clone(), dep.home_id.0), dep);
        Ok(())
    }

    async fn get_deployment(
        &self,
        hub_id: &str,
        home_id: HomeId,
    ) -> Result<Option<AutomationDeployment>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .deployments
            .get(&(hub_id.to_string(), home_id.0))
            .cloned())
    }

    async fn list_deployments(&self) -> Result<Vec<AutomationDeployment>> {
        let mut list: Vec<_> = self.inner.read().unwrap().deployments.values().cloned().collect();
        list.sort_by(|a, b| (&a.hub_id, a.home_id.0).cmp(&(&b.hub_id, b.home_id.0)));
        Ok(list)
    }

    async fn upsert_discovered(&self, row: ZigbeeDiscoveredDevice) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .discovered
            .insert((row.hub_id.clone(), row.ieee.clone()), row);
        Ok(())
    }

    async fn get_discovered(
        &self,
        hub_id: &str,
        ieee: &str,
    ) -> Result<Option<ZigbeeDiscoveredDevice>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .discovered
            .get(&(hub_id.to_string(), ieee.to_string()))
            .cloned())
    }

    async fn list_discovered(
        &self,
        home_id: Option<HomeId>,
    ) -> Result<Vec<ZigbeeDiscoveredDevice>> {
        let g = self.inner.read().unwrap();
        let mut list: Vec<_> = g
            .discovered
            .values()
            .filter(|d| {
                home_id.is_none_or(|h| {
                    g.hubs.get(&d.hub_id).map(|hub| hub.home_id == h).unwrap_or(false)
                })
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| (&a.hub_id, &a.ieee).cmp(&(&b.hub_id, &b.ieee)));
        Ok(list)
    }

    async fn set_discovered_status(
        &self,
        hub_id: &str,
        ieee: &str,
        status: DiscoveredStatus,
    ) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if let Some(row) = g.discovered.get_mut(&(hub_id.to_string(), ieee.to_string())) {
            row.status = status;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_reset_request(
        &self,
        device: DeviceId,
        kind: ResetKind,
        cmd_id: &str,
    ) -> Result<ResetRequest> {
        let mut g = self.inner.write().unwrap();
        let id = Sequences::next(&mut g.seq.reset);
        let request = ResetRequest {
            id,
            device_id: device,
            kind,
            cmd_id: cmd_id.to_string(),
            status: ResetStatus::Pending,
            created_at: Utc::now(),
        };
        g.resets.push(request.clone());
        Ok(request)
    }

    async fn pending_reset_for_device(&self, device: DeviceId) -> Result<Option<ResetRequest>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .resets
            .iter()
            .find(|r| r.device_id == device && r.status == ResetStatus::Pending)
            .cloned())
    }

    async fn resolve_reset_request(
        &self,
        cmd_id: &str,
        status: ResetStatus,
    ) -> Result<Option<ResetRequest>> {
        let mut g = self.inner.write().unwrap();
        let Some(request) = g
            .resets
            .iter_mut()
            .find(|r| r.cmd_id == cmd_id && r.status == ResetStatus::Pending)
        else {
            return Ok(None);
        };
        request.status = status;
        Ok(Some(request.clone()))
    }
}
