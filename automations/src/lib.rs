//! Automation rules and their deployment to hubs. Rules execute on the hub;
//! the backend only validates, versions and synchronizes them. Each rule
//! mutation bumps the home's desired rule-set version, and the deployment
//! controller converges every bound hub's applied version onto it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{Duration, Instant};

use fleet_core::command::{CommandOrchestrator, CommandResolution, HubCommand};
use fleet_core::error::{CoreError, CoreResult};
use fleet_core::model::{
    AutomationDeployment, AutomationRule, CommandStatus, CommandTarget, DeploymentStatus, HomeId,
    TriggerType,
};
use fleet_core::storage::{NewRule, Storage};

pub mod samples;

const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBody {
    pub name: String,
    pub trigger_type: TriggerType,
    pub trigger: Value,
    pub actions: Vec<Value>,
    #[serde(default)]
    pub execution_policy: Option<Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Everything a hub needs to run a home's rules, shipped whole on every sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBundle {
    pub version: i64,
    pub rules: Vec<AutomationRule>,
}

struct SyncState {
    in_flight_cmd: Option<String>,
    retry_delay: Duration,
    next_attempt: Option<Instant>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self { in_flight_cmd: None, retry_delay: RETRY_MIN, next_attempt: None }
    }
}

pub struct AutomationEngine {
    store: Arc<dyn Storage>,
    orchestrator: Arc<CommandOrchestrator>,
    sync: Mutex<HashMap<(String, i64), SyncState>>,
}

impl AutomationEngine {
    pub fn new(store: Arc<dyn Storage>, orchestrator: Arc<CommandOrchestrator>) -> Arc<Self> {
        Arc::new(Self { store, orchestrator, sync: Mutex::new(HashMap::new()) })
    }

    // -- rule CRUD ----------------------------------------------------------

    pub async fn create_rule(&self, home_id: HomeId, body: RuleBody) -> CoreResult<AutomationRule> {
        validate_rule(&body)?;
        let version = Utc::now().timestamp_millis();
        let rule = self
            .store
            .insert_rule(NewRule {
                home_id,
                name: body.name,
                enabled: body.enabled,
                version,
                trigger_type: body.trigger_type,
                trigger: body.trigger,
                actions: body.actions,
                execution_policy: body.execution_policy,
            })
            .await?;
        self.bump_desired(home_id, version).await?;
        Ok(rule)
    }

    pub async fn update_rule(&self, id: i64, body: RuleBody) -> CoreResult<AutomationRule> {
        validate_rule(&body)?;
        let mut rule = self
            .store
            .get_rule(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("rule {id}")))?;
        rule.name = body.name;
        rule.trigger_type = body.trigger_type;
        rule.trigger = body.trigger;
        rule.actions = body.actions;
        rule.execution_policy = body.execution_policy;
        rule.enabled = body.enabled;
        rule.version = Utc::now().timestamp_millis();
        let updated = self.store.update_rule(rule).await?;
        self.bump_desired(updated.home_id, updated.version).await?;
        Ok(updated)
    }

    pub async fn delete_rule(&self, id: i64) -> CoreResult<()> {
        let Some(rule) = self.store.delete_rule(id).await? else {
            return Err(CoreError::not_found(format!("rule {id}")));
        };
        // deleting must still advance the version so hubs drop the rule
        self.bump_desired(rule.home_id, Utc::now().timestamp_millis()).await?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> CoreResult<AutomationRule> {
        let mut rule = self
            .store
            .get_rule(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("rule {id}")))?;
        rule.enabled = enabled;
        rule.version = Utc::now().timestamp_millis();
        let updated = self.store.update_rule(rule).await?;
        self.bump_desired(updated.home_id, updated.version).await?;
        Ok(updated)
    }

    pub async fn list_rules(&self, home_id: HomeId) -> Result<Vec<AutomationRule>> {
        self.store.list_rules(home_id).await
    }

    pub async fn get_rule(&self, id: i64) -> Result<Option<AutomationRule>> {
        self.store.get_rule(id).await
    }

    pub async fn hub_status(&self, hub_id: &str) -> Result<Vec<AutomationDeployment>> {
        let all = self.store.list_deployments().await?;
        Ok(all.into_iter().filter(|d| d.hub_id == hub_id).collect())
    }

    // -- deployment control loop --------------------------------------------

    /// Seeds the deployment row for a freshly activated hub so the
    /// reconciler starts tracking it.
    pub async fn ensure_hub_deployment(&self, hub_id: &str, home_id: HomeId) -> Result<()> {
        if self.store.get_deployment(hub_id, home_id).await?.is_some() {
            return Ok(());
        }
        let desired = self
            .store
            .list_rules(home_id)
            .await?
            .iter()
            .map(|r| r.version)
            .max()
            .unwrap_or(0);
        let status =
            if desired == 0 { DeploymentStatus::Applied } else { DeploymentStatus::Syncing };
        self.store
            .upsert_deployment(AutomationDeployment {
                hub_id: hub_id.to_string(),
                home_id,
                desired_version: desired,
                applied_version: 0,
                status,
                last_msg: None,
                updated_at: Utc::now(),
            })
            .await
    }

    async fn bump_desired(&self, home_id: HomeId, version: i64) -> Result<()> {
        for hub in self.store.list_hubs(Some(home_id)).await? {
            let mut dep = self
                .store
                .get_deployment(&hub.hub_id, home_id)
                .await?
                .unwrap_or(AutomationDeployment {
                    hub_id: hub.hub_id.clone(),
                    home_id,
                    desired_version: 0,
                    applied_version: 0,
                    status: DeploymentStatus::Syncing,
                    last_msg: None,
                    updated_at: Utc::now(),
                });
            dep.desired_version = dep.desired_version.max(version);
            if dep.applied_version < dep.desired_version {
                dep.status = DeploymentStatus::Syncing;
            }
            dep.updated_at = Utc::now();
            self.store.upsert_deployment(dep).await?;
        }
        Ok(())
    }

    /// One reconcile sweep: pushes a rules_sync at every deployment that is
    /// behind, skipping offline hubs, in-flight syncs and backoff windows.
    pub async fn reconcile(&self) -> Result<()> {
        for dep in self.store.list_deployments().await? {
            if dep.applied_version >= dep.desired_version {
                continue;
            }
            let key = (dep.hub_id.clone(), dep.home_id.0);
            {
                let sync = self.sync.lock().unwrap();
                if let Some(state) = sync.get(&key) {
                    if state.in_flight_cmd.is_some() {
                        continue;
                    }
                    if state.next_attempt.is_some_and(|at| Instant::now() < at) {
                        continue;
                    }
                }
            }
            let online =
                self.store.get_hub(&dep.hub_id).await?.map(|h| h.online).unwrap_or(false);
            if !online {
                continue;
            }
            if let Err(e) = self.push_bundle(&dep).await {
                tracing::warn!(hub = %dep.hub_id, "rules_sync dispatch failed: {e}");
            }
        }
        Ok(())
    }

    async fn push_bundle(&self, dep: &AutomationDeployment) -> Result<()> {
        let rules: Vec<AutomationRule> = self
            .store
            .list_rules(dep.home_id)
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        let bundle = RuleBundle { version: dep.desired_version, rules };
        let command = self
            .orchestrator
            .submit_hub_command(
                &dep.hub_id,
                HubCommand::RulesSync {
                    version: bundle.version,
                    rules: serde_json::to_value(&bundle.rules)?,
                },
                false,
            )
            .await
            .map_err(anyhow::Error::from)?;

        self.sync
            .lock()
            .unwrap()
            .entry((dep.hub_id.clone(), dep.home_id.0))
            .or_default()
            .in_flight_cmd = Some(command.cmd_id.clone());

        let mut updated = dep.clone();
        updated.status = DeploymentStatus::Syncing;
        updated.updated_at = Utc::now();
        self.store.upsert_deployment(updated).await?;
        Ok(())
    }

    /// Consumes terminal rules_sync commands: an ACK moves the applied
    /// version forward, anything else marks FAILED and schedules a retry.
    pub async fn on_resolution(&self, resolution: &CommandResolution) -> Result<()> {
        let command = &resolution.command;
        let CommandTarget::Hub(hub_id) = &command.target else {
            return Ok(());
        };
        let Ok(HubCommand::RulesSync { version, .. }) =
            serde_json::from_value::<HubCommand>(command.payload.clone())
        else {
            return Ok(());
        };

        let key = (hub_id.clone(), command.home_id.0);
        {
            let mut sync = self.sync.lock().unwrap();
            let state = sync.entry(key).or_default();
            if state.in_flight_cmd.as_deref() == Some(command.cmd_id.as_str()) {
                state.in_flight_cmd = None;
            }
            match command.status {
                CommandStatus::Acked => {
                    state.retry_delay = RETRY_MIN;
                    state.next_attempt = None;
                }
                _ => {
                    state.next_attempt = Some(Instant::now() + state.retry_delay);
                    state.retry_delay = (state.retry_delay * 2).min(RETRY_MAX);
                }
            }
        }

        let Some(mut dep) = self.store.get_deployment(hub_id, command.home_id).await? else {
            return Ok(());
        };
        match command.status {
            CommandStatus::Acked => {
                let applied = resolution.applied_version.unwrap_or(version);
                dep.applied_version = applied.min(dep.desired_version);
                dep.status = if dep.applied_version == dep.desired_version {
                    DeploymentStatus::Applied
                } else {
                    DeploymentStatus::Syncing
                };
                dep.last_msg = Some(format!("hub applied version {applied}"));
            }
            CommandStatus::Failed | CommandStatus::Timeout => {
                dep.status = DeploymentStatus::Failed;
                dep.last_msg = command.error.clone();
            }
            CommandStatus::Pending => return Ok(()),
        }
        dep.updated_at = Utc::now();
        self.store.upsert_deployment(dep).await?;
        Ok(())
    }

    /// A hub coming back online always re-attempts, regardless of backoff.
    pub fn on_hub_online(&self, hub_id: &str) {
        let mut sync = self.sync.lock().unwrap();
        for ((hub, _), state) in sync.iter_mut() {
            if hub.as_str() == hub_id {
                state.retry_delay = RETRY_MIN;
                state.next_attempt = None;
            }
        }
    }

    /// Periodic reconcile loop.
    pub fn spawn_reconciler(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.reconcile().await {
                    tracing::warn!("automation reconcile failed: {e}");
                }
            }
        });
    }
}

fn validate_rule(body: &RuleBody) -> CoreResult<()> {
    if body.name.trim().is_empty() {
        return Err(CoreError::validation("rule name must not be empty"));
    }
    if body.actions.is_empty() {
        return Err(CoreError::validation("rule needs at least one action"));
    }
    if !body.trigger.is_object() {
        return Err(CoreError::validation("trigger must be an object"));
    }
    Ok(())
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
        engine: Arc<AutomationEngine>,
        home: HomeId,
    }

    async fn fixture_with_hub(online: bool) -> Fixture {
        let store = InMemoryStorage::default();
        let bus = InMemoryBus::default();
        let orch = CommandOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            EventHub::shared(),
            CommandTimeouts::default(),
        );
        let engine = AutomationEngine::new(Arc::new(store.clone()), Arc::clone(&orch));

        let home = store.create_home("Home", UserId(1)).await.unwrap().id;
        store
            .insert_hub_inventory(HubInventory {
                hub_id: "h1".into(),
                serial: None,
                model_id: "hub".into(),
                setup_code_hash: "x".into(),
                mqtt_secret_hash: None,
                status: InventoryStatus::Claimed,
                claimed_by_user_id: Some(UserId(1)),
                claimed_home_id: Some(home),
                claimed_at: Some(Utc::now()),
                failed_attempts: 0,
                last_failed_at: None,
            })
            .await
            .unwrap();
        store
            .upsert_hub(Hub {
                hub_id: "h1".into(),
                home_id: home,
                firmware_version: None,
                online,
                last_seen: Some(Utc::now()),
            })
            .await
            .unwrap();
        engine.ensure_hub_deployment("h1", home).await.unwrap();

        Fixture { store, bus, orch, engine, home }
    }

    #[tokio::test]
    async fn rule_edit_propagates_to_applied() {
        let f = fixture_with_hub(true).await;
        let mut set_sub = f.bus.subscribe(&wire::hub_set_topic("h1")).await.unwrap();

        let rule = f
            .engine
            .create_rule(f.home, samples::motion_light("motion-1", "light-1"))
            .await
            .unwrap();
        let desired = f.store.get_deployment("h1", f.home).await.unwrap().unwrap().desired_version;
        assert_eq!(desired, rule.version);

        f.engine.reconcile().await.unwrap();
        let published = set_sub.next().await.expect("rules_sync on the wire");
        let msg: wire::CommandMsg = serde_json::from_slice(&published.payload).unwrap();
        assert_eq!(msg.payload.get("cmd").and_then(|v| v.as_str()), Some("rules_sync"));
        assert_eq!(msg.payload.get("version").and_then(|v| v.as_i64()), Some(rule.version));

        // hub acks with the applied version → deployment converges
        let resolved = f
            .orch
            .handle_ack(&msg.cmd_id, true, None, Some(rule.version))
            .await
            .unwrap()
            .unwrap();
        f.engine
            .on_resolution(&CommandResolution {
                command: resolved,
                applied_version: Some(rule.version),
            })
            .await
            .unwrap();

        let dep = f.store.get_deployment("h1", f.home).await.unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Applied);
        assert_eq!(dep.applied_version, rule.version);
    }

    #[tokio::test]
    async fn offline_hub_is_skipped_until_reconnect() {
        let f = fixture_with_hub(false).await;
        f.engine
            .create_rule(f.home, samples::motion_light("motion-1", "light-1"))
            .await
            .unwrap();

        let mut set_sub = f.bus.subscribe(&wire::hub_set_topic("h1")).await.unwrap();
        f.engine.reconcile().await.unwrap();
        // nothing published while the hub is offline
        tokio::select! {
            biased;
            _ = set_sub.next() => panic!("should not sync an offline hub"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        f.store.set_hub_presence("h1", true, Utc::now()).await.unwrap();
        f.engine.on_hub_online("h1");
        f.engine.reconcile().await.unwrap();
        assert!(set_sub.next().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sync_backs_off_then_retries() {
        let f = fixture_with_hub(true).await;
        f.engine
            .create_rule(f.home, samples::motion_light("motion-1", "light-1"))
            .await
            .unwrap();
        let mut set_sub = f.bus.subscribe(&wire::hub_set_topic("h1")).await.unwrap();

        f.engine.reconcile().await.unwrap();
        let first = set_sub.next().await.unwrap();
        let msg: wire::CommandMsg = serde_json::from_slice(&first.payload).unwrap();
        let resolved = f
            .orch
            .handle_ack(&msg.cmd_id, false, Some("hub rejected bundle".into()), None)
            .await
            .unwrap()
            .unwrap();
        f.engine
            .on_resolution(&CommandResolution { command: resolved, applied_version: None })
            .await
            .unwrap();

        let dep = f.store.get_deployment("h1", f.home).await.unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Failed);
        assert_eq!(dep.last_msg.as_deref(), Some("hub rejected bundle"));

        // inside the backoff window nothing is sent
        f.engine.reconcile().await.unwrap();
        tokio::select! {
            biased;
            _ = set_sub.next() => panic!("retried inside backoff window"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        f.engine.reconcile().await.unwrap();
        assert!(set_sub.next().await.is_some());
    }

    #[tokio::test]
    async fn delete_still_advances_the_version() {
        let f = fixture_with_hub(true).await;
        let rule = f
            .engine
            .create_rule(f.home, samples::motion_light("motion-1", "light-1"))
            .await
            .unwrap();
        let before = f.store.get_deployment("h1", f.home).await.unwrap().unwrap().desired_version;
        f.engine.delete_rule(rule.id).await.unwrap();
        let after = f.store.get_deployment("h1", f.home).await.unwrap().unwrap().desired_version;
        assert!(after >= before);
        let dep = f.store.get_deployment("h1", f.home).await.unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Syncing);
    }

    #[tokio::test]
    async fn rejects_empty_rules() {
        let f = fixture_with_hub(true).await;
        let err = f
            .engine
            .create_rule(
                f.home,
                RuleBody {
                    name: "".into(),
                    trigger_type: TriggerType::Event,
                    trigger: serde_json::json!({}),
                    actions: vec![serde_json::json!({"do": "x"})],
                    execution_policy: None,
                    enabled: true,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, fleet_core::error::ErrorKind::ValidationError);
    }
}
