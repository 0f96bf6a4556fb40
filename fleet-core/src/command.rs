//! Command orchestration: durable persistence, wire translation per plane,
//! ACK correlation and deadline-driven timeouts. Commands to one target are
//! serialized; targets are independent.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::bus::{Bus, PublishOpts};
use crate::error::{CoreError, CoreResult};
use crate::fanout::{EventHub, StreamEvent};
use crate::keyed::KeyedMutex;
use crate::model::{
    Command, CommandStatus, CommandTarget, Device, DeviceId, Protocol,
};
use crate::storage::{NewCommand, Storage};
use crate::wire;

#[derive(Debug, Clone, Copy)]
pub struct CommandTimeouts {
    /// How long a published command may wait for its ACK.
    pub ack: Duration,
    /// How long an offline-allowed command may sit queued before timing out.
    pub offline_ttl: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self { ack: Duration::from_secs(8), offline_ttl: Duration::from_secs(24 * 60 * 60) }
    }
}

/// Caller-facing command body. MQTT-direct devices take the low-level
/// payload verbatim; Zigbee devices take an action the hub translates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandInput {
    Action { action: String, #[serde(default)] params: serde_json::Value },
    Payload(serde_json::Value),
}

/// Management payloads addressed to hubs, stored as the command payload and
/// shipped inside the standard command envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HubCommand {
    FirmwareInstall { version: String, url: String, sha256: String },
    RulesSync { version: i64, rules: serde_json::Value },
    PermitJoin { open: bool, duration_s: u32, token: Uuid },
}

/// Terminal transition fanned out to the control loops (rollouts, rule
/// deployment, inventory resets).
#[derive(Debug, Clone)]
pub struct CommandResolution {
    pub command: Command,
    pub applied_version: Option<i64>,
}

pub struct CommandOrchestrator {
    store: Arc<dyn Storage>,
    bus: Arc<dyn Bus>,
    events: Arc<EventHub>,
    timeouts: CommandTimeouts,
    locks: KeyedMutex<String>,
    heap: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    heap_notify: Notify,
    resolutions: broadcast::Sender<CommandResolution>,
    queued: Mutex<Vec<(String, String)>>,
}

impl CommandOrchestrator {
    pub fn new(
        store: Arc<dyn Storage>,
        bus: Arc<dyn Bus>,
        events: Arc<EventHub>,
        timeouts: CommandTimeouts,
    ) -> Arc<Self> {
        let (resolutions, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            bus,
            events,
            timeouts,
            locks: KeyedMutex::default(),
            heap: Mutex::new(BinaryHeap::new()),
            heap_notify: Notify::new(),
            resolutions,
            queued: Mutex::new(Vec::new()),
        })
    }

    /// Terminal transitions, in the order they happen.
    pub fn resolutions(&self) -> broadcast::Receiver<CommandResolution> {
        self.resolutions.subscribe()
    }

    /// Runs the deadline loop. One per process.
    pub fn spawn_scheduler(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = this.heap.lock().unwrap();
                    heap.peek().map(|Reverse((at, cmd_id))| (*at, cmd_id.clone()))
                };
                match next {
                    None => this.heap_notify.notified().await,
                    Some((at, _)) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {
                                for cmd_id in this.pop_due() {
                                    if let Err(e) = this.expire(&cmd_id).await {
                                        tracing::warn!("deadline expiry for {cmd_id} failed: {e}");
                                    }
                                }
                            }
                            _ = this.heap_notify.notified() => {}
                        }
                    }
                }
            }
        });
    }

    /// Reloads PENDING rows after a restart and re-arms their deadlines at
    /// `sent_at + timeout`, so a crash never loses a command.
    pub async fn recover(&self) -> Result<()> {
        let pending = self.store.list_pending_commands().await?;
        let count = pending.len();
        for command in pending {
            let deadline = command.sent_at
                + ChronoDuration::from_std(self.timeouts.ack).unwrap_or(ChronoDuration::seconds(8));
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.arm(&command.cmd_id, Instant::now() + remaining);
        }
        if count > 0 {
            tracing::info!("re-armed {count} pending command deadlines");
        }
        Ok(())
    }

    pub async fn submit_device_command(
        &self,
        device_id: DeviceId,
        input: CommandInput,
        offline_allowed: bool,
    ) -> CoreResult<Command> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("device {}", device_id.0)))?;
        if !device.lifecycle_status.accepts_commands() {
            return Err(CoreError::precondition("device is not bound"));
        }
        let home_id =
            device.home_id.ok_or_else(|| CoreError::precondition("device has no home"))?;

        let payload = match (&device.protocol, input) {
            (Protocol::Mqtt, CommandInput::Payload(value)) => value,
            (Protocol::Zigbee, CommandInput::Action { action, params }) => {
                if device.zigbee_ieee.is_none() {
                    return Err(CoreError::precondition("zigbee device has no ieee address"));
                }
                serde_json::json!({ "action": action, "params": params })
            }
            (Protocol::Mqtt, CommandInput::Action { .. }) => {
                return Err(CoreError::validation("mqtt devices take a raw payload"));
            }
            (Protocol::Zigbee, CommandInput::Payload(_)) => {
                return Err(CoreError::validation("zigbee devices take {action, params}"));
            }
        };

        let online = self.device_online(&device).await?;
        if !online && !offline_allowed {
            return Err(CoreError::precondition("device is offline"));
        }

        let target = CommandTarget::Device(device.id);
        self.persist_and_dispatch(target, home_id, payload, online).await
    }

    pub async fn submit_hub_command(
        &self,
        hub_id: &str,
        command: HubCommand,
        offline_allowed: bool,
    ) -> CoreResult<Command> {
        let hub = self
            .store
            .get_hub(hub_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("hub {hub_id}")))?;
        if !hub.online && !offline_allowed {
            return Err(CoreError::precondition("hub is offline"));
        }
        let payload = serde_json::to_value(&command).map_err(CoreError::internal)?;
        let target = CommandTarget::Hub(hub.hub_id.clone());
        self.persist_and_dispatch(target, hub.home_id, payload, hub.online).await
    }

    async fn persist_and_dispatch(
        &self,
        target: CommandTarget,
        home_id: crate::model::HomeId,
        payload: serde_json::Value,
        online: bool,
    ) -> CoreResult<Command> {
        let key = target_key(&target);
        let _guard = self.locks.lock(key.clone()).await;

        let command = self
            .store
            .insert_command(NewCommand {
                target,
                home_id,
                cmd_id: Uuid::new_v4().to_string(),
                payload,
                sent_at: Utc::now(),
            })
            .await?;

        if online {
            self.dispatch(&command).await?;
            self.arm(&command.cmd_id, Instant::now() + self.timeouts.ack);
        } else {
            self.queued.lock().unwrap().push((key, command.cmd_id.clone()));
            self.arm(&command.cmd_id, Instant::now() + self.timeouts.offline_ttl);
        }

        self.emit_update(&command);
        Ok(command)
    }

    /// New row, new cmdId, same payload. Only terminal non-ACKED commands may
    /// be retried; retrying PENDING or ACKED is a conflict.
    pub async fn retry(&self, id_or_cmd_id: &str) -> CoreResult<Command> {
        let previous = match id_or_cmd_id.parse::<i64>() {
            Ok(id) => self.store.get_command(id).await?,
            Err(_) => self.store.get_command_by_cmd_id(id_or_cmd_id).await?,
        }
        .ok_or_else(|| CoreError::not_found(format!("command {id_or_cmd_id}")))?;

        match previous.status {
            CommandStatus::Pending => {
                return Err(CoreError::conflict("command is still pending"));
            }
            CommandStatus::Acked => {
                return Err(CoreError::conflict("command already acknowledged"));
            }
            CommandStatus::Failed | CommandStatus::Timeout => {}
        }

        let key = target_key(&previous.target);
        let _guard = self.locks.lock(key).await;

        let command = self
            .store
            .insert_command(NewCommand {
                target: previous.target.clone(),
                home_id: previous.home_id,
                cmd_id: Uuid::new_v4().to_string(),
                payload: previous.payload.clone(),
                sent_at: Utc::now(),
            })
            .await?;

        self.dispatch(&command).await?;
        self.arm(&command.cmd_id, Instant::now() + self.timeouts.ack);
        self.emit_update(&command);
        Ok(command)
    }

    /// ACK/cmd_result correlation from the ingest path. Unknown or already
    /// resolved cmdIds are ignored; nothing else is ever mutated.
    pub async fn handle_ack(
        &self,
        cmd_id: &str,
        ok: bool,
        error: Option<String>,
        applied_version: Option<i64>,
    ) -> Result<Option<Command>> {
        let (status, acked_at, error) = if ok {
            (CommandStatus::Acked, Some(Utc::now()), None)
        } else {
            (CommandStatus::Failed, None, Some(error.unwrap_or_else(|| "nack".to_string())))
        };
        let Some(command) = self.store.transition_command(cmd_id, status, acked_at, error).await?
        else {
            return Ok(None);
        };
        self.emit_update(&command);
        let _ = self
            .resolutions
            .send(CommandResolution { command: command.clone(), applied_version });
        Ok(Some(command))
    }

    /// Dispatches commands that were queued while their target was offline.
    /// Called on presence transitions to online.
    pub async fn flush_queued(&self, target: &CommandTarget) {
        let key = target_key(target);
        let cmd_ids: Vec<String> = {
            let mut queued = self.queued.lock().unwrap();
            let (matching, rest): (Vec<_>, Vec<_>) =
                queued.drain(..).partition(|(k, _)| *k == key);
            *queued = rest;
            matching.into_iter().map(|(_, cmd_id)| cmd_id).collect()
        };
        for cmd_id in cmd_ids {
            match self.store.get_command_by_cmd_id(&cmd_id).await {
                Ok(Some(command)) if command.status == CommandStatus::Pending => {
                    if let Err(e) = self.dispatch(&command).await {
                        tracing::warn!("dispatching queued command {cmd_id} failed: {e}");
                        continue;
                    }
                    self.arm(&cmd_id, Instant::now() + self.timeouts.ack);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("loading queued command {cmd_id} failed: {e}"),
            }
        }
    }

    async fn dispatch(&self, command: &Command) -> Result<()> {
        let (topic, body) = match &command.target {
            CommandTarget::Device(device_id) => {
                let device = self
                    .store
                    .get_device(*device_id)
                    .await?
                    .context("command target device vanished")?;
                match device.protocol {
                    Protocol::Mqtt => {
                        let topic =
                            wire::device_set_topic(command.home_id, &device.device_uid);
                        let msg = wire::CommandMsg::new(
                            &command.cmd_id,
                            Utc::now(),
                            command.payload.clone(),
                        );
                        (topic, serde_json::to_vec(&msg)?)
                    }
                    Protocol::Zigbee => {
                        let ieee = device
                            .zigbee_ieee
                            .as_deref()
                            .context("zigbee device lost its ieee address")?;
                        let action = command
                            .payload
                            .get("action")
                            .and_then(|v| v.as_str())
                            .context("zigbee command payload missing action")?
                            .to_string();
                        let args = command
                            .payload
                            .get("params")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        let msg =
                            wire::ZbCommandMsg::new(&command.cmd_id, Utc::now(), action, args);
                        (wire::zb_set_topic(ieee), serde_json::to_vec(&msg)?)
                    }
                }
            }
            CommandTarget::Hub(hub_id) => {
                let msg =
                    wire::CommandMsg::new(&command.cmd_id, Utc::now(), command.payload.clone());
                (wire::hub_set_topic(hub_id), serde_json::to_vec(&msg)?)
            }
        };
        self.bus.publish(&topic, Bytes::from(body), PublishOpts::command()).await
    }

    async fn device_online(&self, device: &Device) -> Result<bool> {
        match device.protocol {
            Protocol::Mqtt => Ok(self
                .store
                .get_state_current(device.id)
                .await?
                .map(|s| s.online)
                .unwrap_or(false)),
            Protocol::Zigbee => {
                let Some(hub_id) = device.hub_id.as_deref() else {
                    return Ok(false);
                };
                Ok(self.store.get_hub(hub_id).await?.map(|h| h.online).unwrap_or(false))
            }
        }
    }

    fn arm(&self, cmd_id: &str, at: Instant) {
        self.heap.lock().unwrap().push(Reverse((at, cmd_id.to_string())));
        self.heap_notify.notify_one();
    }

    fn pop_due(&self) -> Vec<String> {
        let mut heap = self.heap.lock().unwrap();
        let now = Instant::now();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse((at, _))| *at <= now) {
            if let Some(Reverse((_, cmd_id))) = heap.pop() {
                due.push(cmd_id);
            }
        }
        due
    }

    async fn expire(&self, cmd_id: &str) -> Result<()> {
        let Some(command) = self
            .store
            .transition_command(
                cmd_id,
                CommandStatus::Timeout,
                None,
                Some("ack deadline exceeded".to_string()),
            )
            .await?
        else {
            return Ok(());
        };
        self.emit_update(&command);
        let _ = self.resolutions.send(CommandResolution { command, applied_version: None });
        Ok(())
    }

    fn emit_update(&self, command: &Command) {
        let (device_db_id, hub_id) = match &command.target {
            CommandTarget::Device(id) => (Some(*id), None),
            CommandTarget::Hub(hub) => (None, Some(hub.clone())),
        };
        self.events.publish(
            command.home_id,
            StreamEvent::CommandUpdated {
                device_db_id,
                hub_id,
                cmd_id: command.cmd_id.clone(),
                status: command.status,
                sent_at: Some(command.sent_at),
                acked_at: command.acked_at,
                error: command.error.clone(),
            },
        );
    }
}

fn target_key(target: &CommandTarget) -> String {
    match target {
        CommandTarget::Device(id) => format!("d:{}", id.0),
        CommandTarget::Hub(hub) => format!("h:{hub}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::error::ErrorKind;
    use crate::model::{HomeId, LifecycleStatus, UserId};
    use crate::storage::{InMemoryStorage, NewDevice};
    use tokio_stream::StreamExt;

    async fn bound_mqtt_device(
        store: &InMemoryStorage,
        online: bool,
    ) -> (HomeId, crate::model::Device) {
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
                serial: Some("SER-1".into()),
                model_id: Some("m1".into()),
                bound_at: Some(Utc::now()),
            })
            .await
            .unwrap();
        store
            .put_state_current(crate::model::DeviceStateCurrent {
                device_id: device.id,
                state: serde_json::json!({}),
                last_seen: Utc::now(),
                online,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        (home.id, device)
    }

    fn orchestrator(
        store: &InMemoryStorage,
        bus: &InMemoryBus,
    ) -> (Arc<CommandOrchestrator>, Arc<EventHub>) {
        let events = EventHub::shared();
        let orch = CommandOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::clone(&events),
            CommandTimeouts::default(),
        );
        (orch, events)
    }

    #[tokio::test]
    async fn submit_publishes_and_ack_resolves() {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let (orch, _) = orchestrator(&store, &bus);
        let (home, device) = bound_mqtt_device(&store, true).await;

        let mut sub = bus.subscribe("home/+/device/+/set").await.unwrap();
        let command = orch
            .submit_device_command(
                device.id,
                CommandInput::Payload(serde_json::json!({"relay": true})),
                false,
            )
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Pending);

        let published = sub.next().await.expect("command on the wire");
        assert_eq!(published.topic, format!("home/{}/device/d1/set", home.0));
        let msg: wire::CommandMsg = serde_json::from_slice(&published.payload).unwrap();
        assert_eq!(msg.cmd_id, command.cmd_id);
        assert_eq!(msg.payload, serde_json::json!({"relay": true}));

        let resolved =
            orch.handle_ack(&command.cmd_id, true, None, None).await.unwrap().unwrap();
        assert_eq!(resolved.status, CommandStatus::Acked);
        assert!(resolved.acked_at.is_some());

        // a second ack for the same cmdId is a no-op
        assert!(orch.handle_ack(&command.cmd_id, true, None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_marks_failed_with_error() {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let (orch, _) = orchestrator(&store, &bus);
        let (_, device) = bound_mqtt_device(&store, true).await;

        let command = orch
            .submit_device_command(
                device.id,
                CommandInput::Payload(serde_json::json!({"relay": false})),
                false,
            )
            .await
            .unwrap();
        let resolved = orch
            .handle_ack(&command.cmd_id, false, Some("unsupported".into()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, CommandStatus::Failed);
        assert_eq!(resolved.error.as_deref(), Some("unsupported"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let (orch, _) = orchestrator(&store, &bus);
        orch.spawn_scheduler();
        let (_, device) = bound_mqtt_device(&store, true).await;

        let command = orch
            .submit_device_command(
                device.id,
                CommandInput::Payload(serde_json::json!({"relay": true})),
                false,
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let stored = store.get_command_by_cmd_id(&command.cmd_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Timeout);
        assert_eq!(stored.error.as_deref(), Some("ack deadline exceeded"));
    }

    #[tokio::test]
    async fn retry_rules() {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let (orch, _) = orchestrator(&store, &bus);
        let (_, device) = bound_mqtt_device(&store, true).await;

        let command = orch
            .submit_device_command(
                device.id,
                CommandInput::Payload(serde_json::json!({"relay": true})),
                false,
            )
            .await
            .unwrap();

        // pending → conflict
        let err = orch.retry(&command.cmd_id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        orch.handle_ack(&command.cmd_id, false, Some("boom".into()), None).await.unwrap();
        let retried = orch.retry(&command.cmd_id).await.unwrap();
        assert_ne!(retried.cmd_id, command.cmd_id);
        assert_eq!(retried.payload, command.payload);
        assert_eq!(retried.status, CommandStatus::Pending);

        // acked → conflict
        orch.handle_ack(&retried.cmd_id, true, None, None).await.unwrap();
        let err = orch.retry(&retried.cmd_id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn offline_rejects_unless_allowed_then_queues() {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let (orch, _) = orchestrator(&store, &bus);
        let (_, device) = bound_mqtt_device(&store, false).await;

        let err = orch
            .submit_device_command(
                device.id,
                CommandInput::Payload(serde_json::json!({"relay": true})),
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);

        let mut sub = bus.subscribe("home/+/device/+/set").await.unwrap();
        let command = orch
            .submit_device_command(
                device.id,
                CommandInput::Payload(serde_json::json!({"mgmt": "FACTORY_RESET"})),
                true,
            )
            .await
            .unwrap();

        // nothing on the wire while offline
        tokio::task::yield_now().await;
        orch.flush_queued(&CommandTarget::Device(device.id)).await;
        let published = sub.next().await.expect("queued command dispatched");
        let msg: wire::CommandMsg = serde_json::from_slice(&published.payload).unwrap();
        assert_eq!(msg.cmd_id, command.cmd_id);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_rearms_pending_deadlines() {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let (_, device) = bound_mqtt_device(&store, true).await;

        // a command persisted before a crash: PENDING, never resolved
        let orphan = store
            .insert_command(crate::storage::NewCommand {
                target: CommandTarget::Device(device.id),
                home_id: HomeId(1),
                cmd_id: Uuid::new_v4().to_string(),
                payload: serde_json::json!({"relay": true}),
                sent_at: Utc::now(),
            })
            .await
            .unwrap();

        // the restarted orchestrator picks it up
        let (orch, _) = orchestrator(&store, &bus);
        orch.recover().await.unwrap();
        orch.spawn_scheduler();

        tokio::time::advance(Duration::from_secs(9)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let stored = store.get_command_by_cmd_id(&orphan.cmd_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Timeout);
    }

    #[tokio::test]
    async fn zigbee_commands_use_action_envelope() {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let (orch, _) = orchestrator(&store, &bus);
        let home = store.create_home("Home", UserId(1)).await.unwrap();
        store
            .insert_hub_inventory(crate::model::HubInventory {
                hub_id: "h1".into(),
                serial: None,
                model_id: "hub-m1".into(),
                setup_code_hash: "x".into(),
                mqtt_secret_hash: None,
                status: crate::model::InventoryStatus::Claimed,
                claimed_by_user_id: Some(UserId(1)),
                claimed_home_id: Some(home.id),
                claimed_at: Some(Utc::now()),
                failed_attempts: 0,
                last_failed_at: None,
            })
            .await
            .unwrap();
        store
            .upsert_hub(crate::model::Hub {
                hub_id: "h1".into(),
                home_id: home.id,
                firmware_version: None,
                online: true,
                last_seen: Some(Utc::now()),
            })
            .await
            .unwrap();
        let device = store
            .insert_device(NewDevice {
                device_uid: Uuid::new_v4().to_string(),
                home_id: home.id,
                room_id: None,
                device_type: "gate".into(),
                protocol: Protocol::Zigbee,
                hub_id: Some("h1".into()),
                zigbee_ieee: Some("00124b0001abcd12".into()),
                lifecycle_status: LifecycleStatus::Bound,
                serial: None,
                model_id: Some("gate-1".into()),
                bound_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        let mut sub = bus.subscribe("home/zb/+/set").await.unwrap();
        let command = orch
            .submit_device_command(
                device.id,
                CommandInput::Action {
                    action: "gate.open".into(),
                    params: serde_json::json!({"source": "mobile"}),
                },
                false,
            )
            .await
            .unwrap();

        let published = sub.next().await.expect("zigbee command");
        assert_eq!(published.topic, "home/zb/00124b0001abcd12/set");
        let msg: wire::ZbCommandMsg = serde_json::from_slice(&published.payload).unwrap();
        assert_eq!(msg.cmd_id, command.cmd_id);
        assert_eq!(msg.action, "gate.open");
        assert_eq!(msg.args, serde_json::json!({"source": "mobile"}));
    }
}
