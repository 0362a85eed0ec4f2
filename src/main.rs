//! firstboot-rs - first-boot initialization for cloud guests
//!
//! Exit status is 0 on success, 1 on error and 1001 when a plugin asked for
//! a reboot before the remaining stages can run.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use firstboot_rs::config::{Config, load_config};
use firstboot_rs::osutils::HostOsUtils;
use firstboot_rs::osutils::dhcp::LeaseFileDhcpSource;
use firstboot_rs::osutils::drives::LabelConfigDriveManager;
use firstboot_rs::plugins::Stage;
use firstboot_rs::services::{ServiceDeps, detect_metadata_service};
use firstboot_rs::{FirstbootError, MetadataKey, query_metadata, run_stages};

const REBOOT_EXIT_CODE: i32 = 1001;

#[derive(Parser)]
#[command(name = "firstboot-rs")]
#[command(author, version, about = "First-boot initialization from cloud metadata", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(long, env = "FIRSTBOOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the main and finalize stages
    Init,
    /// Run the main stage only
    Main,
    /// Run the finalize stage only
    Finalize,
    /// Print a metadata value from the detected service
    Query {
        #[arg(value_enum)]
        key: MetadataKey,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn host_deps() -> ServiceDeps {
    ServiceDeps {
        os: Arc::new(HostOsUtils::new()),
        dhcp: Arc::new(LeaseFileDhcpSource::new()),
        drives: Arc::new(LabelConfigDriveManager::new()),
    }
}

async fn run_command(command: Commands, config: &Config) -> Result<i32, FirstbootError> {
    let deps = host_deps();
    let stages: &[Stage] = match command {
        Commands::Init => &[Stage::Main, Stage::Finalize],
        Commands::Main => &[Stage::Main],
        Commands::Finalize => &[Stage::Finalize],
        Commands::Query { key } => {
            let mut service = detect_metadata_service(config, &deps).await?;
            let value = query_metadata(service.as_mut(), key).await;
            if let Err(e) = service.cleanup().await {
                warn!("Failed to clean up {}: {}", service.name(), e);
            }
            println!("{}", value?);
            return Ok(0);
        }
    };

    let report = run_stages(stages, config, &deps).await?;
    let failed = report.failed_plugins();
    if !failed.is_empty() {
        warn!("Plugins failed: {:?}", failed);
    }
    if report.reboot_required {
        info!("Reboot required, exiting with code {}", REBOOT_EXIT_CODE);
        return Ok(REBOOT_EXIT_CODE);
    }
    info!("Execution of {} done", report.service);
    Ok(0)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match load_config(cli.config.as_deref()).await {
        Ok(config) => {
            let command = cli.command.unwrap_or_else(|| {
                info!("No command specified, running init");
                Commands::Init
            });
            run_command(command, &config).await.unwrap_or_else(|e| {
                error!("{}", e);
                1
            })
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    };

    std::process::exit(code);
}
