//! Hub firmware rollouts: per-target dispatch through the command
//! orchestrator, attempt counters with backoff, pause/resume, and a derived
//! rollout status. A single failing target never takes the loop down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use fleet_core::{
    command::{CommandOrchestrator, CommandResolution, HubCommand},
    error::{CoreError, CoreResult},
    model::{
        CommandStatus, CommandTarget, FirmwareRelease, FirmwareRollout, RolloutStatus,
        RolloutTarget, TargetState,
    },
    storage::{NewRelease, Storage},
};

const MAX_ATTEMPTS: i32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(5);
/// How long a hub must keep reporting the target version before the target
/// is sealed as SUCCESS.
const SEAL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct RolloutView {
    #[serde(flatten)]
    pub rollout: FirmwareRollout,
    pub targets: Vec<RolloutTarget>,
}

pub struct RolloutEngine {
    store: Arc<dyn Storage>,
    commands: Arc<CommandOrchestrator>,
}

impl RolloutEngine {
    pub fn new(store: Arc<dyn Storage>, commands: Arc<CommandOrchestrator>) -> Arc<Self> {
        Arc::new(Self { store, commands })
    }

    pub async fn create_release(&self, new: NewRelease) -> CoreResult<FirmwareRelease> {
        if new.version.trim().is_empty() || new.url.trim().is_empty() {
            return Err(CoreError::validation("version and url are required"));
        }
        if new.sha256.len() != 64 || !new.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::validation("sha256 must be 64 hex chars"));
        }
        Ok(self.store.insert_release(new).await?)
    }

    pub async fn create_rollout(
        &self,
        release_id: i64,
        hub_ids: Vec<String>,
    ) -> CoreResult<FirmwareRollout> {
        if hub_ids.is_empty() {
            return Err(CoreError::validation("a rollout needs at least one target hub"));
        }
        self.store
            .get_release(release_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("release {release_id}")))?;
        for hub_id in &hub_ids {
            if self.store.get_hub(hub_id).await?.is_none() {
                return Err(CoreError::validation(format!("hub {hub_id} is not activated")));
            }
        }
        Ok(self.store.create_rollout(release_id, hub_ids).await?)
    }

    /// CREATED → RUNNING, or resumes a paused rollout from where it left off.
    pub async fn start(&self, id: i64) -> CoreResult<FirmwareRollout> {
        let rollout = self.get_rollout(id).await?;
        match rollout.status {
            RolloutStatus::Created | RolloutStatus::Paused => {
                self.store.set_rollout_status(id, RolloutStatus::Running).await?;
            }
            RolloutStatus::Running => {}
            RolloutStatus::Success | RolloutStatus::Failed => {
                return Err(CoreError::conflict("rollout already finished"));
            }
        }
        self.reconcile_rollout(id).await?;
        Ok(self.get_rollout(id).await?)
    }

    /// Halts new dispatches; in-flight commands complete normally.
    pub async fn pause(&self, id: i64) -> CoreResult<FirmwareRollout> {
        let rollout = self.get_rollout(id).await?;
        if rollout.status != RolloutStatus::Running {
            return Err(CoreError::conflict("only a running rollout can pause"));
        }
        self.store.set_rollout_status(id, RolloutStatus::Paused).await?;
        Ok(self.get_rollout(id).await?)
    }

    pub async fn view(&self, id: i64) -> CoreResult<RolloutView> {
        let rollout = self.get_rollout(id).await?;
        let targets = self.store.list_rollout_targets(id).await?;
        Ok(RolloutView { rollout, targets })
    }

    pub async fn list(&self) -> Result<Vec<FirmwareRollout>> {
        self.store.list_rollouts().await
    }

    /// One sweep over every running rollout.
    pub async fn reconcile(&self) -> Result<()> {
        for rollout in self.store.list_rollouts().await? {
            if rollout.status == RolloutStatus::Running {
                if let Err(e) = self.reconcile_rollout(rollout.id).await {
                    tracing::warn!(rollout = rollout.id, "rollout reconcile failed: {e}");
                }
            }
        }
        Ok(())
    }

    async fn reconcile_rollout(&self, id: i64) -> Result<()> {
        let rollout = match self.store.get_rollout(id).await? {
            Some(r) if r.status == RolloutStatus::Running => r,
            _ => return Ok(()),
        };
        let Some(release) = self.store.get_release(rollout.release_id).await? else {
            return Ok(());
        };
        for target in self.store.list_rollout_targets(id).await? {
            if let Err(e) = self.advance_target(&release, target).await {
                tracing::warn!(rollout = id, "target advance failed: {e}");
            }
        }
        self.refresh_status(id).await
    }

    async fn advance_target(
        &self,
        release: &FirmwareRelease,
        mut target: RolloutTarget,
    ) -> Result<()> {
        match target.state {
            TargetState::Created => {
                self.try_dispatch(release, target).await?;
            }
            TargetState::Failed => {
                let backoff_over =
                    target.next_attempt_at.is_none_or(|at| Utc::now() >= at);
                if target.attempt < MAX_ATTEMPTS && backoff_over {
                    self.try_dispatch(release, target).await?;
                }
            }
            TargetState::Running => {
                // sealing: the hub must still be on the target version once
                // the grace window passes
                let seal_due = target.next_attempt_at.is_none_or(|at| Utc::now() >= at);
                if seal_due {
                    let reported = self
                        .store
                        .get_hub(&target.hub_id)
                        .await?
                        .and_then(|h| h.firmware_version);
                    if reported.as_deref() == Some(release.version.as_str()) {
                        target.state = TargetState::Success;
                        target.last_msg = Some(format!("firmware {} verified", release.version));
                    } else {
                        target.state = TargetState::Applying;
                        target.last_msg = Some("version regressed during grace".to_string());
                    }
                    target.next_attempt_at = None;
                    self.store.update_rollout_target(target).await?;
                }
            }
            TargetState::Downloading | TargetState::Applying | TargetState::Success => {}
        }
        Ok(())
    }

    async fn try_dispatch(
        &self,
        release: &FirmwareRelease,
        mut target: RolloutTarget,
    ) -> Result<()> {
        // an in-flight install command means we are waiting on its ACK
        if let Some(cmd_id) = target.cmd_id.as_deref()
            && let Some(command) = self.store.get_command_by_cmd_id(cmd_id).await?
            && command.status == CommandStatus::Pending
        {
            return Ok(());
        }
        let online = self.store.get_hub(&target.hub_id).await?.map(|h| h.online).unwrap_or(false);
        if !online {
            return Ok(());
        }
        let command = match self
            .commands
            .submit_hub_command(
                &target.hub_id,
                HubCommand::FirmwareInstall {
                    version: release.version.clone(),
                    url: release.url.clone(),
                    sha256: release.sha256.clone(),
                },
                false,
            )
            .await
        {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(hub = %target.hub_id, "install dispatch refused: {e}");
                return Ok(());
            }
        };
        target.attempt += 1;
        target.cmd_id = Some(command.cmd_id);
        target.sent_at = Some(command.sent_at);
        target.next_attempt_at = None;
        target.last_msg = Some(format!("install dispatched (attempt {})", target.attempt));
        self.store.update_rollout_target(target).await?;
        Ok(())
    }

    /// Terminal install-command outcomes: ACK moves the target into
    /// DOWNLOADING, a NACK or timeout schedules a retry until attempts run
    /// out.
    pub async fn on_resolution(&self, resolution: &CommandResolution) -> Result<()> {
        let command = &resolution.command;
        if !matches!(command.target, CommandTarget::Hub(_)) {
            return Ok(());
        }
        if !matches!(
            serde_json::from_value::<HubCommand>(command.payload.clone()),
            Ok(HubCommand::FirmwareInstall { .. })
        ) {
            return Ok(());
        }
        let Some(mut target) = self.store.find_target_by_cmd(&command.cmd_id).await? else {
            return Ok(());
        };
        match command.status {
            CommandStatus::Acked => {
                target.state = TargetState::Downloading;
                target.acked_at = command.acked_at;
                target.last_msg = Some("install acknowledged".to_string());
                target.next_attempt_at = None;
            }
            CommandStatus::Failed | CommandStatus::Timeout => {
                target.state = TargetState::Failed;
                target.last_msg = command.error.clone();
                if target.attempt < MAX_ATTEMPTS {
                    let backoff = RETRY_BASE * 2u32.pow(target.attempt.max(1) as u32 - 1);
                    target.next_attempt_at = Some(
                        Utc::now()
                            + chrono::Duration::from_std(backoff)
                                .unwrap_or(chrono::Duration::seconds(5)),
                    );
                } else {
                    target.next_attempt_at = None;
                }
            }
            CommandStatus::Pending => return Ok(()),
        }
        let rollout_id = target.rollout_id;
        self.store.update_rollout_target(target).await?;
        self.refresh_status(rollout_id).await
    }

    /// Hub status reports carry the running firmware version; matching the
    /// release moves the target toward SUCCESS.
    pub async fn on_hub_firmware(&self, hub_id: &str, version: &str) -> Result<()> {
        for rollout in self.store.list_rollouts().await? {
            if !matches!(rollout.status, RolloutStatus::Running | RolloutStatus::Paused) {
                continue;
            }
            let Some(release) = self.store.get_release(rollout.release_id).await? else {
                continue;
            };
            for mut target in self.store.list_rollout_targets(rollout.id).await? {
                if target.hub_id != hub_id {
                    continue;
                }
                match target.state {
                    TargetState::Downloading | TargetState::Applying
                        if version == release.version =>
                    {
                        target.state = TargetState::Running;
                        target.next_attempt_at = Some(
                            Utc::now()
                                + chrono::Duration::from_std(SEAL_GRACE)
                                    .unwrap_or(chrono::Duration::seconds(30)),
                        );
                        target.last_msg =
                            Some(format!("hub reports {version}, sealing after grace"));
                        self.store.update_rollout_target(target).await?;
                    }
                    TargetState::Downloading => {
                        // still on the old build: the hub is mid-apply
                        target.state = TargetState::Applying;
                        self.store.update_rollout_target(target).await?;
                    }
                    _ => {}
                }
            }
            self.refresh_status(rollout.id).await?;
        }
        Ok(())
    }

    async fn refresh_status(&self, rollout_id: i64) -> Result<()> {
        let Some(rollout) = self.store.get_rollout(rollout_id).await? else {
            return Ok(());
        };
        if matches!(rollout.status, RolloutStatus::Created | RolloutStatus::Paused) {
            return Ok(());
        }
        let targets = self.store.list_rollout_targets(rollout_id).await?;
        let all_success = targets.iter().all(|t| t.state == TargetState::Success);
        let any_terminal_failed = targets
            .iter()
            .any(|t| t.state == TargetState::Failed && t.attempt >= MAX_ATTEMPTS);
        let any_active = targets.iter().any(|t| {
            !matches!(t.state, TargetState::Success)
                && !(t.state == TargetState::Failed && t.attempt >= MAX_ATTEMPTS)
        });

        let derived = if all_success {
            RolloutStatus::Success
        } else if any_terminal_failed && !any_active {
            RolloutStatus::Failed
        } else {
            RolloutStatus::Running
        };
        if derived != rollout.status {
            self.store.set_rollout_status(rollout_id, derived).await?;
        }
        Ok(())
    }

    pub fn spawn_reconciler(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.reconcile().await {
                    tracing::warn!("rollout reconcile failed: {e}");
                }
            }
        });
    }

    async fn get_rollout(&self, id: i64) -> CoreResult<FirmwareRollout> {
        self.store
            .get_rollout(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("rollout {id}")))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::bus::{Bus, InMemoryBus};
    use fleet_core::command::CommandTimeouts;
    use fleet_core::fanout::EventHub;
    use fleet_core::model::{Hub, HubInventory, InventoryStatus, UserId};
    use fleet_core::storage::InMemoryStorage;
    use fleet_core::wire;
    use tokio_stream::StreamExt;

    struct Fixture {
        store: InMemoryStorage,
        bus: InMemoryBus,
        orch: Arc<CommandOrchestrator>,
        engine: Arc<RolloutEngine>,
        release: FirmwareRelease,
    }

    async fn fixture(hubs: &[(&str, bool)]) -> Fixture {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let orch = CommandOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            EventHub::shared(),
            CommandTimeouts::default(),
        );
        let engine = RolloutEngine::new(Arc::new(store.clone()), Arc::clone(&orch));

        let home = store.create_home("Home", UserId(1)).await.unwrap();
        for (hub_id, online) in hubs {
            store
                .insert_hub_inventory(HubInventory {
                    hub_id: (*hub_id).into(),
                    serial: None,
                    model_id: "hub".into(),
                    setup_code_hash: "x".into(),
                    mqtt_secret_hash: None,
                    status: InventoryStatus::Claimed,
                    claimed_by_user_id: Some(UserId(1)),
                    claimed_home_id: Some(home.id),
                    claimed_at: Some(Utc::now()),
                    failed_attempts: 0,
                    last_failed_at: None,
                })
                .await
                .unwrap();
            store
                .upsert_hub(Hub {
                    hub_id: (*hub_id).into(),
                    home_id: home.id,
                    firmware_version: Some("1.0.0".into()),
                    online: *online,
                    last_seen: Some(Utc::now()),
                })
                .await
                .unwrap();
        }
        let release = engine
            .create_release(NewRelease {
                target_type: "hub".into(),
                version: "2.0.0".into(),
                url: "https://firmware.example.com/hub-2.0.0.bin".into(),
                sha256: "a".repeat(64),
                size: Some(1024),
                notes: None,
            })
            .await
            .unwrap();

        Fixture { store, bus, orch, engine, release }
    }

    async fn target_state(f: &Fixture, rollout_id: i64, hub_id: &str) -> RolloutTarget {
        f.store
            .list_rollout_targets(rollout_id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.hub_id == hub_id)
            .unwrap()
    }

    #[tokio::test]
    async fn start_dispatches_to_online_targets_only() {
        let f = fixture(&[("hubA", true), ("hubB", false)]).await;
        let mut sub = f.bus.subscribe(&wire::hub_set_topic("hubA")).await.unwrap();

        let rollout = f
            .engine
            .create_rollout(f.release.id, vec!["hubA".into(), "hubB".into()])
            .await
            .unwrap();
        assert_eq!(rollout.status, RolloutStatus::Created);
        let started = f.engine.start(rollout.id).await.unwrap();
        assert_eq!(started.status, RolloutStatus::Running);

        // hubA got the install immediately
        let published = sub.next().await.expect("install command");
        let msg: wire::CommandMsg = serde_json::from_slice(&published.payload).unwrap();
        assert_eq!(msg.payload.get("cmd").and_then(|v| v.as_str()), Some("firmware_install"));
        assert_eq!(
            msg.payload.get("sha256").and_then(|v| v.as_str()),
            Some(f.release.sha256.as_str())
        );
        let a = target_state(&f, rollout.id, "hubA").await;
        assert_eq!(a.attempt, 1);
        assert!(a.cmd_id.is_some());

        // hubB stays untouched while offline
        let b = target_state(&f, rollout.id, "hubB").await;
        assert_eq!(b.state, TargetState::Created);
        assert_eq!(b.attempt, 0);

        // hubB comes online; the next sweep picks it up
        f.store.set_hub_presence("hubB", true, Utc::now()).await.unwrap();
        f.engine.reconcile().await.unwrap();
        let b = target_state(&f, rollout.id, "hubB").await;
        assert_eq!(b.attempt, 1);
    }

    #[tokio::test]
    async fn ack_then_version_report_reaches_success() {
        let f = fixture(&[("hubA", true)]).await;
        let rollout = f.engine.create_rollout(f.release.id, vec!["hubA".into()]).await.unwrap();
        f.engine.start(rollout.id).await.unwrap();

        let target = target_state(&f, rollout.id, "hubA").await;
        let cmd_id = target.cmd_id.clone().unwrap();
        let resolved = f.orch.handle_ack(&cmd_id, true, None, None).await.unwrap().unwrap();
        f.engine
            .on_resolution(&CommandResolution { command: resolved, applied_version: None })
            .await
            .unwrap();
        assert_eq!(target_state(&f, rollout.id, "hubA").await.state, TargetState::Downloading);

        // the hub reboots into the new build and reports it
        f.store.set_hub_firmware("hubA", "2.0.0").await.unwrap();
        f.engine.on_hub_firmware("hubA", "2.0.0").await.unwrap();
        let running = target_state(&f, rollout.id, "hubA").await;
        assert_eq!(running.state, TargetState::Running);

        // fast-forward the grace window and seal
        let mut sealed = running.clone();
        sealed.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(1));
        f.store.update_rollout_target(sealed).await.unwrap();
        f.engine.reconcile().await.unwrap();
        assert_eq!(target_state(&f, rollout.id, "hubA").await.state, TargetState::Success);
        assert_eq!(
            f.store.get_rollout(rollout.id).await.unwrap().unwrap().status,
            RolloutStatus::Success
        );
    }

    #[tokio::test]
    async fn attempts_exhaust_into_terminal_failure() {
        let f = fixture(&[("hubA", true)]).await;
        let rollout = f.engine.create_rollout(f.release.id, vec!["hubA".into()]).await.unwrap();
        f.engine.start(rollout.id).await.unwrap();

        for attempt in 1..=MAX_ATTEMPTS {
            let target = target_state(&f, rollout.id, "hubA").await;
            assert_eq!(target.attempt, attempt);
            let cmd_id = target.cmd_id.clone().unwrap();
            let resolved = f
                .orch
                .handle_ack(&cmd_id, false, Some("flash error".into()), None)
                .await
                .unwrap()
                .unwrap();
            f.engine
                .on_resolution(&CommandResolution { command: resolved, applied_version: None })
                .await
                .unwrap();
            // clear backoff so the next sweep retries immediately
            let mut target = target_state(&f, rollout.id, "hubA").await;
            target.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(1));
            f.store.update_rollout_target(target).await.unwrap();
            f.engine.reconcile().await.unwrap();
        }

        let target = target_state(&f, rollout.id, "hubA").await;
        assert_eq!(target.state, TargetState::Failed);
        assert_eq!(target.attempt, MAX_ATTEMPTS);
        assert_eq!(
            f.store.get_rollout(rollout.id).await.unwrap().unwrap().status,
            RolloutStatus::Failed
        );
    }

    #[tokio::test]
    async fn pause_blocks_dispatch_but_not_acks() {
        let f = fixture(&[("hubA", true), ("hubB", false)]).await;
        let rollout = f
            .engine
            .create_rollout(f.release.id, vec!["hubA".into(), "hubB".into()])
            .await
            .unwrap();
        f.engine.start(rollout.id).await.unwrap();
        f.engine.pause(rollout.id).await.unwrap();

        // hubB comes online, but the pause holds new dispatches back
        f.store.set_hub_presence("hubB", true, Utc::now()).await.unwrap();
        f.engine.reconcile().await.unwrap();
        assert_eq!(target_state(&f, rollout.id, "hubB").await.attempt, 0);

        // the in-flight install on hubA still resolves
        let cmd_id = target_state(&f, rollout.id, "hubA").await.cmd_id.unwrap();
        let resolved = f.orch.handle_ack(&cmd_id, true, None, None).await.unwrap().unwrap();
        f.engine
            .on_resolution(&CommandResolution { command: resolved, applied_version: None })
            .await
            .unwrap();
        assert_eq!(target_state(&f, rollout.id, "hubA").await.state, TargetState::Downloading);

        // resume picks hubB up
        f.engine.start(rollout.id).await.unwrap();
        assert_eq!(target_state(&f, rollout.id, "hubB").await.attempt, 1);
    }
}
