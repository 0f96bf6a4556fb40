use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HomeId(pub i64);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub i64);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Database id of a live Device row. The wire identity is `Device::device_uid`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub i64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub token: Uuid,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Home {
    pub id: HomeId,
    pub name: String,
    pub owner_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub home_id: HomeId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryStatus {
    FactoryNew,
    Claimed,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubInventory {
    pub hub_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    pub model_id: String,
    #[serde(skip_serializing)]
    pub setup_code_hash: String,
    #[serde(skip_serializing)]
    pub mqtt_secret_hash: Option<String>,
    pub status: InventoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by_user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_home_id: Option<HomeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub failed_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hub {
    pub hub_id: String,
    pub home_id: HomeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Mqtt,
    Zigbee,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInventory {
    pub serial: String,
    /// Becomes the wire `deviceId` of an MQTT-plane device once claimed.
    pub device_uid: Uuid,
    pub type_default: String,
    pub protocol: Protocol,
    pub model_id: String,
    #[serde(skip_serializing)]
    pub setup_code_hash: String,
    #[serde(skip_serializing)]
    pub mqtt_secret_hash: Option<String>,
    pub status: InventoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by_user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_home_id: Option<HomeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub failed_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    FactoryNew,
    Claiming,
    Bound,
    Active,
    Unbound,
}

impl LifecycleStatus {
    pub fn accepts_commands(self) -> bool {
        matches!(self, LifecycleStatus::Bound | LifecycleStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    /// Wire identity: inventory `device_uid` on the MQTT plane, a generated
    /// UUID on the Zigbee plane. Immutable after creation.
    pub device_uid: String,
    /// Cleared on factory reset; a device without a home accepts no commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_id: Option<HomeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(rename = "type")]
    pub device_type: String,
    pub protocol: Protocol,
    /// None for MQTT-direct devices, required for Zigbee ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zigbee_ieee: Option<String>,
    pub lifecycle_status: LifecycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unbound_at: Option<DateTime<Utc>>,
}

/// Latest state snapshot per device. Replaced wholesale, never tombstoned;
/// `last_seen` is the firmware timestamp and is non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStateCurrent {
    pub device_id: DeviceId,
    pub state: serde_json::Value,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStateHistoryRow {
    pub device_id: DeviceId,
    pub state: serde_json::Value,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    pub id: i64,
    pub device_id: DeviceId,
    pub home_id: HomeId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub source_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Acked,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }
}

/// What a command is addressed to. Device commands ride the device/zigbee
/// topics; hub commands carry management payloads (firmware install,
/// rules_sync, permit-join).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum CommandTarget {
    Device(DeviceId),
    Hub(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: i64,
    pub target: CommandTarget,
    pub home_id: HomeId,
    pub cmd_id: String,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirmwareRelease {
    pub id: i64,
    pub target_type: String,
    pub version: String,
    pub url: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutStatus {
    Created,
    Running,
    Paused,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirmwareRollout {
    pub id: i64,
    pub release_id: i64,
    pub status: RolloutStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetState {
    Created,
    Downloading,
    Applying,
    Running,
    Success,
    Failed,
}

impl TargetState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TargetState::Success | TargetState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutTarget {
    pub rollout_id: i64,
    pub hub_id: String,
    pub state: TargetState,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Event,
    State,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationRule {
    pub id: i64,
    pub home_id: HomeId,
    pub name: String,
    pub enabled: bool,
    pub version: i64,
    pub trigger_type: TriggerType,
    pub trigger: serde_json::Value,
    pub actions: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_policy: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Syncing,
    Applied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationDeployment {
    pub hub_id: String,
    pub home_id: HomeId,
    pub desired_version: i64,
    pub applied_version: i64,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_msg: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingMode {
    Legacy,
    SerialFirst,
    TypeFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZigbeePairingSession {
    pub token: Uuid,
    pub owner_user_id: UserId,
    pub hub_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_id: Option<HomeId>,
    pub mode: PairingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveredStatus {
    Pending,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZigbeeDiscoveredDevice {
    pub hub_id: String,
    pub ieee: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_model_id: Option<String>,
    pub pairing_token: Uuid,
    pub status: DiscoveredStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetKind {
    Reconnect,
    FactoryReset,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResetRequest {
    pub id: i64,
    pub device_id: DeviceId,
    pub kind: ResetKind,
    pub cmd_id: String,
    pub status: ResetStatus,
    pub created_at: DateTime<Utc>,
}
