//! firstboot-rs library
//!
//! First-boot initialization of a cloud guest: pick the metadata service of
//! the platform the instance runs on, then run the configured plugins
//! against it.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`#![forbid(unsafe_code)]`)
//! - **One service per boot**: services are probed in configuration order
//!   and the first that loads is used for the whole run
//! - **Run once**: plugins that completed are not run again for the same
//!   instance

pub mod cache;
pub mod config;
pub mod http;
pub mod osutils;
pub mod plugins;
pub mod retry;
pub mod services;
pub mod state;
pub mod testing;

mod error;

pub use error::FirstbootError;

use tracing::{error, info, warn};

use config::Config;
use plugins::{ExecutionState, Plugin, SharedData, Stage, StageReport};
use services::{MetadataService, ServiceDeps};
use state::PluginStateStore;

/// Outcome of one driver invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub service: &'static str,
    pub stages: Vec<StageReport>,
    /// A plugin asked for a reboot; later stages were not run
    pub reboot_required: bool,
}

impl RunReport {
    /// Names of the plugins that failed, across all stages
    pub fn failed_plugins(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .flat_map(|s| s.failed().map(|r| r.plugin))
            .collect()
    }
}

/// Select the metadata service and run `stages` in order
pub async fn run_stages(
    stages: &[Stage],
    config: &Config,
    deps: &ServiceDeps,
) -> Result<RunReport, FirstbootError> {
    let mut service = services::detect_metadata_service(config, deps).await?;
    let plugins = plugins::load_plugins(config, deps.os.clone());
    Ok(run_with_service(stages, config, &plugins, service.as_mut()).await)
}

/// Run `stages` against an already loaded service
///
/// Provisioning is reported to the platform once, before the finalize stage
/// or after the last stage, unless a reboot was requested. Only runs that
/// include the main stage report it. The service is always cleaned up.
pub async fn run_with_service(
    stages: &[Stage],
    config: &Config,
    plugins: &[Box<dyn Plugin>],
    service: &mut dyn MetadataService,
) -> RunReport {
    let provisions = stages.contains(&Stage::Main);
    if provisions && let Err(e) = service.provisioning_started().await {
        warn!("Failed to report provisioning start: {}", e);
    }

    let mut state = open_state(config, service).await;
    let mut shared = SharedData::new();
    let mut reports = Vec::new();
    let mut reported = !provisions;
    let mut reboot_required = false;

    for stage in stages {
        if *stage == Stage::Finalize && !reported {
            report_provisioning(service, &reports).await;
            reported = true;
        }

        info!("Starting stage: {}", stage);
        let report = plugins::execute_stage(*stage, plugins, service, &mut shared, &mut state).await;
        reboot_required = report.reboot_required;
        reports.push(report);

        if reboot_required {
            info!("Reboot required after stage {}", stage);
            break;
        }
        info!("Completed stage: {}", stage);
    }

    if !reported && !reboot_required {
        report_provisioning(service, &reports).await;
    }

    if let Err(e) = service.cleanup().await {
        warn!("Failed to clean up {}: {}", service.name(), e);
    }

    RunReport {
        service: service.name(),
        stages: reports,
        reboot_required,
    }
}

/// Plugin state for the instance; in-memory only when the instance id or
/// the state directory is unusable
async fn open_state(config: &Config, service: &mut dyn MetadataService) -> ExecutionState {
    let instance_id = match service.get_instance_id().await {
        Ok(id) => id,
        Err(e) => {
            warn!("Cannot get instance id, plugin state is not persisted: {}", e);
            return ExecutionState::new();
        }
    };

    match PluginStateStore::open(&config.state_dir, &instance_id).await {
        Ok(store) => ExecutionState::with_store(store),
        Err(e) => {
            warn!(
                "Cannot open plugin state in {}: {}",
                config.state_dir.display(),
                e
            );
            ExecutionState::new()
        }
    }
}

async fn report_provisioning(service: &mut dyn MetadataService, reports: &[StageReport]) {
    let failed: Vec<_> = reports
        .iter()
        .flat_map(|s| s.failed().map(|r| r.plugin))
        .collect();

    let result = if failed.is_empty() {
        service.provisioning_completed().await
    } else {
        error!("Provisioning failed, plugins in error: {:?}", failed);
        service.provisioning_failed().await
    };
    if let Err(e) = result {
        warn!("Failed to report provisioning status: {}", e);
    }
}

/// Metadata values printable by `firstboot-rs query`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MetadataKey {
    InstanceId,
    Hostname,
    PublicKeys,
    UserData,
    AdminPassword,
}

/// Read one metadata value from a loaded service, as text
pub async fn query_metadata(
    service: &mut dyn MetadataService,
    key: MetadataKey,
) -> Result<String, FirstbootError> {
    match key {
        MetadataKey::InstanceId => service.get_instance_id().await,
        MetadataKey::Hostname => service.get_host_name().await,
        MetadataKey::PublicKeys => Ok(service.get_public_keys().await?.join("\n")),
        MetadataKey::UserData => {
            let data = service.get_user_data().await?;
            Ok(String::from_utf8_lossy(&data).into_owned())
        }
        MetadataKey::AdminPassword => service
            .get_admin_password()
            .await?
            .ok_or_else(|| FirstbootError::NotFound("admin-password".to_string())),
    }
}
