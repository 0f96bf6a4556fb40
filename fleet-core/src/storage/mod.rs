mod memory;
mod postgres;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    AutomationDeployment, AutomationRule, Command, CommandStatus, CommandTarget, Device,
    DeviceEvent, DeviceId, DeviceInventory, DeviceStateCurrent, DeviceStateHistoryRow,
    DiscoveredStatus, FirmwareRelease, FirmwareRollout, Home, HomeId, Hub, HubInventory,
    LifecycleStatus, Protocol, ResetKind, ResetRequest, ResetStatus, RolloutStatus, RolloutTarget,
    Room, RoomId, Session, TriggerType, User, UserId,
};

#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub home_id: Option<HomeId>,
    pub model_id: Option<String>,
    pub online: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub home_id: Option<HomeId>,
    pub device_id: Option<DeviceId>,
    pub date: Option<chrono::NaiveDate>,
    pub event_type: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub status: Option<CommandStatus>,
    pub device_id: Option<DeviceId>,
    pub date: Option<chrono::NaiveDate>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device_uid: String,
    pub home_id: HomeId,
    pub room_id: Option<RoomId>,
    pub device_type: String,
    pub protocol: Protocol,
    pub hub_id: Option<String>,
    pub zigbee_ieee: Option<String>,
    pub lifecycle_status: LifecycleStatus,
    pub serial: Option<String>,
    pub model_id: Option<String>,
    pub bound_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub target: CommandTarget,
    pub home_id: HomeId,
    pub cmd_id: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRelease {
    pub target_type: String,
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub home_id: HomeId,
    pub name: String,
    pub enabled: bool,
    pub version: i64,
    pub trigger_type: TriggerType,
    pub trigger: serde_json::Value,
    pub actions: Vec<serde_json::Value>,
    pub execution_policy: Option<serde_json::Value>,
}

/// The persistence contract. Postgres in production, in-memory in tests.
/// Errors carry a `CoreError` where the taxonomy matters (uniqueness,
/// missing rows); plain failures bubble as-is.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn ping(&self) -> Result<()>;

    // -- users & sessions ---------------------------------------------------
    async fn create_user(&self, email: &str, password_hash: &str, is_admin: bool) -> Result<User>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn insert_session(&self, session: Session) -> Result<()>;
    async fn get_session(&self, token: Uuid) -> Result<Option<Session>>;

    // -- homes & rooms ------------------------------------------------------
    async fn create_home(&self, name: &str, owner: UserId) -> Result<Home>;
    async fn get_home(&self, id: HomeId) -> Result<Option<Home>>;
    async fn home_ids_for_user(&self, user: UserId) -> Result<Vec<HomeId>>;
    async fn get_room(&self, id: RoomId) -> Result<Option<Room>>;

    // -- inventory ----------------------------------------------------------
    async fn insert_hub_inventory(&self, row: HubInventory) -> Result<()>;
    async fn get_hub_inventory(&self, hub_id: &str) -> Result<Option<HubInventory>>;
    async fn list_hub_inventory(&self) -> Result<Vec<HubInventory>>;
    /// Optimistic claim: only applies when the row is still FACTORY_NEW.
    /// Returns false when the predicate did not match.
    async fn claim_hub_inventory(
        &self,
        hub_id: &str,
        user: UserId,
        home: HomeId,
        mqtt_secret_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn record_hub_claim_failure(&self, hub_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn insert_device_inventory(&self, row: DeviceInventory) -> Result<()>;
    async fn get_device_inventory(&self, serial: &str) -> Result<Option<DeviceInventory>>;
    async fn list_device_inventory(&self) -> Result<Vec<DeviceInventory>>;
    async fn claim_device_inventory(
        &self,
        serial: &str,
        user: UserId,
        home: HomeId,
        mqtt_secret_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn record_device_claim_failure(&self, serial: &str, at: DateTime<Utc>) -> Result<()>;
    /// Flips a claimed row back to FACTORY_NEW after a factory reset.
    async fn release_device_inventory(&self, serial: &str) -> Result<()>;

    // -- hubs ---------------------------------------------------------------
    async fn upsert_hub(&self, hub: Hub) -> Result<()>;
    async fn get_hub(&self, hub_id: &str) -> Result<Option<Hub>>;
    async fn list_hubs(&self, home_id: Option<HomeId>) -> Result<Vec<Hub>>;
    async fn set_hub_presence(
        &self,
        hub_id: &str,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_hub_firmware(&self, hub_id: &str, version: &str) -> Result<()>;

    // -- devices ------------------------------------------------------------
    async fn insert_device(&self, new: NewDevice) -> Result<Device>;
    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>>;
    async fn get_device_by_uid(&self, device_uid: &str) -> Result<Option<Device>>;
    async fn get_device_by_ieee(&self, ieee: &str) -> Result<Option<Device>>;
    async fn get_device_by_serial(&self, serial: &str) -> Result<Option<Device>>;
    async fn list_devices(&self, filter: DeviceFilter) -> Result<Vec<Device>>;
    async fn set_device_lifecycle(&self, id: DeviceId, status: LifecycleStatus) -> Result<()>;
    async fn bind_zigbee_device(
        &self,
        id: DeviceId,
        ieee: &str,
        hub_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
    /// UNBOUND + cleared home link; the wire identity stays put.
    async fn unbind_device(&self, id: DeviceId, at: DateTime<Utc>) -> Result<()>;
    /// Re-claims an UNBOUND row into a (possibly different) home after a
    /// factory reset; the immutable `device_uid` survives.
    async fn rebind_device(
        &self,
        id: DeviceId,
        home: HomeId,
        room: Option<RoomId>,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_device_firmware(&self, id: DeviceId, version: &str) -> Result<()>;

    // -- telemetry ----------------------------------------------------------
    async fn get_state_current(&self, device: DeviceId) -> Result<Option<DeviceStateCurrent>>;
    async fn put_state_current(&self, row: DeviceStateCurrent) -> Result<()>;
    async fn append_state_history(&self, row: DeviceStateHistoryRow) -> Result<()>;
    async fn state_history(
        &self,
        device: DeviceId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<DeviceStateHistoryRow>>;

    async fn append_device_event(
        &self,
        device: DeviceId,
        home: HomeId,
        event_type: &str,
        data: serde_json::Value,
        source_at: DateTime<Utc>,
    ) -> Result<DeviceEvent>;
    async fn list_events(&self, filter: EventFilter) -> Result<Vec<DeviceEvent>>;

    // -- commands -----------------------------------------------------------
    /// Durable PENDING insert; `(target, cmdId)` is unique.
    async fn insert_command(&self, new: NewCommand) -> Result<Command>;
    async fn get_command(&self, id: i64) -> Result<Option<Command>>;
    async fn get_command_by_cmd_id(&self, cmd_id: &str) -> Result<Option<Command>>;
    /// PENDING → terminal, guarded by the row-level status predicate.
    /// Returns None when the row was already resolved (or unknown).
    async fn transition_command(
        &self,
        cmd_id: &str,
        to: CommandStatus,
        acked_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<Option<Command>>;
    async fn list_commands(&self, filter: CommandFilter) -> Result<Vec<Command>>;
    async fn list_pending_commands(&self) -> Result<Vec<Command>>;

    // -- firmware -----------------------------------------------------------
    async fn insert_release(&self, new: NewRelease) -> Result<FirmwareRelease>;
    async fn get_release(&self, id: i64) -> Result<Option<FirmwareRelease>>;
    async fn list_releases(&self) -> Result<Vec<FirmwareRelease>>;
    async fn create_rollout(&self, release_id: i64, hub_ids: Vec<String>)
    -> Result<FirmwareRollout>;
    async fn get_rollout(&self, id: i64) -> Result<Option<FirmwareRollout>>;
    async fn list_rollouts(&self) -> Result<Vec<FirmwareRollout>>;
    async fn set_rollout_status(&self, id: i64, status: RolloutStatus) -> Result<()>;
    async fn list_rollout_targets(&self, rollout_id: i64) -> Result<Vec<RolloutTarget>>;
    async fn update_rollout_target(&self, target: RolloutTarget) -> Result<()>;
    async fn find_target_by_cmd(&self, cmd_id: &str) -> Result<Option<RolloutTarget>>;

    // -- automation rules & deployments ------------------------------------
    async fn insert_rule(&self, new: NewRule) -> Result<AutomationRule>;
    async fn update_rule(&self, rule: AutomationRule) -> Result<AutomationRule>;
    async fn delete_rule(&self, id: i64) -> Result<Option<AutomationRule>>;
    async fn get_rule(&self, id: i64) -> Result<Option<AutomationRule>>;
    async fn list_rules(&self, home_id: HomeId) -> Result<Vec<AutomationRule>>;
    async fn upsert_deployment(&self, dep: AutomationDeployment) -> Result<()>;
    async fn get_deployment(
        &self,
        hub_id: &str,
        home_id: HomeId,
    ) -> Result<Option<AutomationDeployment>>;
    async fn list_deployments(&self) -> Result<Vec<AutomationDeployment>>;

    // -- zigbee pairing -----------------------------------------------------
    async fn upsert_discovered(&self, row: crate::model::ZigbeeDiscoveredDevice) -> Result<()>;
    async fn get_discovered(
        &self,
        hub_id: &str,
        ieee: &str,
    ) -> Result<Option<crate::model::ZigbeeDiscoveredDevice>>;
    async fn list_discovered(
        &self,
        home_id: Option<HomeId>,
    ) -> Result<Vec<crate::model::ZigbeeDiscoveredDevice>>;
    async fn set_discovered_status(
        &self,
        hub_id: &str,
        ieee: &str,
        status: DiscoveredStatus,
    ) -> Result<()>;

    // -- reset requests -----------------------------------------------------
    async fn insert_reset_request(
        &self,
        device: DeviceId,
        kind: ResetKind,
        cmd_id: &str,
    ) -> Result<ResetRequest>;
    async fn pending_reset_for_device(&self, device: DeviceId) -> Result<Option<ResetRequest>>;
    async fn resolve_reset_request(
        &self,
        cmd_id: &str,
        status: ResetStatus,
    ) -> Result<Option<ResetRequest>>;
}
