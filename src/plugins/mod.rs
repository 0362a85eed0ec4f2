//! Plugins run against the selected metadata service
//!
//! Each plugin declares the stage it belongs to. A stage runs its plugins
//! one after another, in configuration order, and a failing plugin never
//! stops the ones after it.

pub mod cloudconfig;
pub mod finalize;
pub mod setserviceuser;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::FirstbootError;
use crate::config::{Config, PluginKind};
use crate::osutils::OsUtils;
use crate::services::MetadataService;
use crate::state::PluginStateStore;

/// Execution stage of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Main,
    /// After provisioning has been reported complete
    Finalize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Main => write!(f, "main"),
            Stage::Finalize => write!(f, "finalize"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Done,
    /// Run the plugin again on the next boot
    ExecuteOnNextBoot,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOutcome {
    pub status: PluginStatus,
    pub reboot_required: bool,
}

impl PluginOutcome {
    pub fn new(status: PluginStatus, reboot_required: bool) -> Self {
        Self {
            status,
            reboot_required,
        }
    }

    /// `Done` without a reboot
    pub fn done() -> Self {
        Self::new(PluginStatus::Done, false)
    }
}

/// Scratch values plugins hand to each other within one invocation
pub type SharedData = HashMap<String, serde_json::Value>;

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> Stage {
        Stage::Main
    }

    async fn execute(
        &self,
        service: &mut dyn MetadataService,
        shared: &mut SharedData,
    ) -> Result<PluginOutcome, FirstbootError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginReport {
    pub plugin: &'static str,
    pub outcome: PluginOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub reports: Vec<PluginReport>,
    /// True when any plugin of the stage asked for a reboot
    pub reboot_required: bool,
}

impl StageReport {
    pub fn failed(&self) -> impl Iterator<Item = &PluginReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome.status, PluginStatus::Error(_)))
    }
}

/// Bookkeeping shared by the stages of one invocation
#[derive(Debug, Default)]
pub struct ExecutionState {
    store: Option<PluginStateStore>,
    executed: HashSet<&'static str>,
}

impl ExecutionState {
    /// In-memory only: nothing is skipped because of earlier boots
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: PluginStateStore) -> Self {
        Self {
            store: Some(store),
            executed: HashSet::new(),
        }
    }

    pub fn store(&self) -> Option<&PluginStateStore> {
        self.store.as_ref()
    }

    pub fn was_executed(&self, plugin: &str) -> bool {
        self.executed.contains(plugin)
    }
}

/// Run the plugins registered for `stage`
pub async fn execute_stage(
    stage: Stage,
    plugins: &[Box<dyn Plugin>],
    service: &mut dyn MetadataService,
    shared: &mut SharedData,
    state: &mut ExecutionState,
) -> StageReport {
    info!("Executing plugins for stage {}", stage);
    let mut reports = Vec::new();

    for plugin in plugins.iter().filter(|p| p.stage() == stage) {
        let name = plugin.name();
        if !state.executed.insert(name) {
            debug!("Plugin {} already executed, skipping", name);
            continue;
        }
        if let Some(store) = &state.store
            && store.is_done(name).await
        {
            debug!("Plugin {} already completed for this instance", name);
            continue;
        }

        info!("Executing plugin {}", name);
        let outcome = match plugin.execute(service, shared).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Plugin {} failed: {}", name, e);
                PluginOutcome::new(PluginStatus::Error(e.to_string()), false)
            }
        };

        if outcome.status == PluginStatus::Done
            && let Some(store) = &state.store
            && let Err(e) = store.mark_done(name).await
        {
            warn!("Cannot record state of plugin {}: {}", name, e);
        }

        reports.push(PluginReport {
            plugin: name,
            outcome,
        });
    }

    let reboot_required = reports.iter().any(|r| r.outcome.reboot_required);
    StageReport {
        stage,
        reports,
        reboot_required,
    }
}

/// Instantiate the configured plugins, in configuration order
pub fn load_plugins(config: &Config, os: Arc<dyn OsUtils>) -> Vec<Box<dyn Plugin>> {
    config
        .plugins
        .iter()
        .map(|kind| -> Box<dyn Plugin> {
            match kind {
                PluginKind::SetServiceUser => Box::new(setserviceuser::SetServiceUserPlugin::new(
                    config.service_username.clone(),
                    config.service_name.clone(),
                    os.clone(),
                )),
                PluginKind::CloudConfig => Box::new(cloudconfig::CloudConfigPlugin::new(
                    config.phone_home_retries,
                    config.retry().interval,
                    os.clone(),
                )),
                PluginKind::Finalize => Box::new(finalize::FinalizePlugin),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPlugin, MockService};
    use tempfile::TempDir;

    fn boxed(plugins: Vec<MockPlugin>) -> Vec<Box<dyn Plugin>> {
        plugins
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn Plugin>)
            .collect()
    }

    #[tokio::test]
    async fn test_reboot_flags_are_aggregated() {
        let plugins = boxed(vec![
            MockPlugin::new("a"),
            MockPlugin::new("b").with_reboot(true),
            MockPlugin::new("c"),
        ]);
        let mut service = MockService::new();
        let mut shared = SharedData::new();

        let report = execute_stage(
            Stage::Main,
            &plugins,
            &mut service,
            &mut shared,
            &mut ExecutionState::new(),
        )
        .await;

        assert!(report.reboot_required);
        assert_eq!(report.reports.len(), 3);
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_the_stage() {
        let failing = MockPlugin::new("failing").with_error("boom");
        let after = MockPlugin::new("after");
        let after_calls = after.calls();
        let plugins = boxed(vec![failing, after]);

        let report = execute_stage(
            Stage::Main,
            &plugins,
            &mut MockService::new(),
            &mut SharedData::new(),
            &mut ExecutionState::new(),
        )
        .await;

        assert_eq!(after_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let failed: Vec<_> = report.failed().map(|r| r.plugin).collect();
        assert_eq!(failed, vec!["failing"]);
        assert!(!report.reboot_required);
    }

    #[tokio::test]
    async fn test_only_plugins_of_the_stage_run() {
        let main = MockPlugin::new("main");
        let fin = MockPlugin::new("fin").with_stage(Stage::Finalize);
        let fin_calls = fin.calls();
        let plugins = boxed(vec![main, fin]);

        let report = execute_stage(
            Stage::Main,
            &plugins,
            &mut MockService::new(),
            &mut SharedData::new(),
            &mut ExecutionState::new(),
        )
        .await;

        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].plugin, "main");
        assert_eq!(fin_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_plugin_runs_once_per_invocation() {
        let first = MockPlugin::new("dup");
        let second = MockPlugin::new("dup");
        let second_calls = second.calls();
        let plugins = boxed(vec![first, second]);
        let mut state = ExecutionState::new();

        let report = execute_stage(
            Stage::Main,
            &plugins,
            &mut MockService::new(),
            &mut SharedData::new(),
            &mut state,
        )
        .await;

        assert_eq!(report.reports.len(), 1);
        assert_eq!(second_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(state.was_executed("dup"));
    }

    #[tokio::test]
    async fn test_done_plugins_are_recorded_and_skipped() {
        let temp = TempDir::new().unwrap();
        let store = PluginStateStore::open(temp.path(), "i-1").await.unwrap();
        let plugins = boxed(vec![
            MockPlugin::new("done"),
            MockPlugin::new("later").with_status(PluginStatus::ExecuteOnNextBoot),
        ]);

        let mut state = ExecutionState::with_store(store.clone());
        execute_stage(
            Stage::Main,
            &plugins,
            &mut MockService::new(),
            &mut SharedData::new(),
            &mut state,
        )
        .await;
        assert!(store.is_done("done").await);
        assert!(!store.is_done("later").await);

        // next boot of the same instance
        let mut state = ExecutionState::with_store(store);
        let report = execute_stage(
            Stage::Main,
            &plugins,
            &mut MockService::new(),
            &mut SharedData::new(),
            &mut state,
        )
        .await;
        let ran: Vec<_> = report.reports.iter().map(|r| r.plugin).collect();
        assert_eq!(ran, vec!["later"]);
    }

    #[tokio::test]
    async fn test_load_plugins_in_config_order() {
        let config = Config {
            plugins: vec![PluginKind::Finalize, PluginKind::CloudConfig],
            ..Config::default()
        };
        let plugins = load_plugins(&config, Arc::new(crate::testing::MockOsUtils::new()));
        let names: Vec<_> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["finalize", "cloudconfig"]);
        assert_eq!(plugins[0].stage(), Stage::Finalize);
    }
}
