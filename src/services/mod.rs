//! Metadata service implementations for various cloud platforms
//!
//! Every service implements [`MetadataService`]. The driver probes the
//! configured services strictly in order and keeps the first one whose
//! [`MetadataService::load`] returns true.

pub mod azure;
pub mod configdrive;
pub mod drive;
pub mod ec2;
pub mod nocloud;
pub mod packet;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::FirstbootError;
use crate::config::{Config, ServiceKind};
use crate::osutils::OsUtils;
use crate::osutils::dhcp::DhcpOptionSource;
use crate::osutils::drives::ConfigDriveManager;

/// Trait for cloud metadata services
///
/// `load` must return true before any accessor is used. Accessors called
/// earlier fail with [`FirstbootError::NotLoaded`]; absent keys fail with
/// [`FirstbootError::NotFound`].
#[async_trait]
pub trait MetadataService: Send {
    /// Name of this service (e.g., "EC2", "Azure")
    fn name(&self) -> &'static str;

    /// Probe the backend and load what is needed to answer accessors.
    ///
    /// Never fails: an unreachable or unusable backend yields false.
    async fn load(&mut self) -> bool;

    async fn get_instance_id(&mut self) -> Result<String, FirstbootError>;

    async fn get_host_name(&mut self) -> Result<String, FirstbootError>;

    async fn get_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        Ok(Vec::new())
    }

    async fn get_user_data(&mut self) -> Result<Vec<u8>, FirstbootError>;

    async fn get_admin_password(&mut self) -> Result<Option<String>, FirstbootError> {
        Ok(None)
    }

    /// Public keys used to encrypt a posted password
    async fn get_encryption_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        Ok(Vec::new())
    }

    fn can_post_password(&self) -> bool {
        false
    }

    async fn post_password(&mut self, _enc_password_b64: &str) -> Result<bool, FirstbootError> {
        Err(FirstbootError::NotSupported(format!(
            "{} cannot post passwords",
            self.name()
        )))
    }

    /// Report to the platform that provisioning has begun
    async fn provisioning_started(&mut self) -> Result<(), FirstbootError> {
        Ok(())
    }

    async fn provisioning_completed(&mut self) -> Result<(), FirstbootError> {
        Ok(())
    }

    async fn provisioning_failed(&mut self) -> Result<(), FirstbootError> {
        Ok(())
    }

    /// Whether [`MetadataService::on_finalize`] does anything
    fn supports_finalize(&self) -> bool {
        false
    }

    /// Action run by the finalize plugin once provisioning completes
    async fn on_finalize(&mut self) -> Result<(), FirstbootError> {
        Ok(())
    }

    /// Release local resources (extracted drives, temporary files)
    async fn cleanup(&mut self) -> Result<(), FirstbootError> {
        Ok(())
    }
}

/// Host collaborators handed to service constructors
#[derive(Clone)]
pub struct ServiceDeps {
    pub os: Arc<dyn OsUtils>,
    pub dhcp: Arc<dyn DhcpOptionSource>,
    pub drives: Arc<dyn ConfigDriveManager>,
}

/// Build a service of the given kind
pub fn build_service(
    kind: ServiceKind,
    config: &Config,
    deps: &ServiceDeps,
) -> Result<Box<dyn MetadataService>, FirstbootError> {
    let service: Box<dyn MetadataService> = match kind {
        ServiceKind::ConfigDrive => Box::new(configdrive::ConfigDriveService::new(
            &config.config_drive,
            deps.drives.clone(),
        )),
        ServiceKind::NoCloud => Box::new(nocloud::NoCloudConfigDriveService::new(
            &config.nocloud,
            deps.drives.clone(),
        )),
        ServiceKind::Ec2 => Box::new(ec2::Ec2Service::new(config, deps.os.clone())?),
        ServiceKind::Azure => Box::new(azure::AzureService::new(
            config,
            deps.os.clone(),
            deps.dhcp.clone(),
        )?),
        ServiceKind::Packet => Box::new(packet::PacketService::new(config)?),
    };
    Ok(service)
}

/// Probe `candidates` in order and return the first service that loads
pub async fn select_service(
    candidates: Vec<Box<dyn MetadataService>>,
) -> Result<Box<dyn MetadataService>, FirstbootError> {
    for mut service in candidates {
        debug!("Trying metadata service: {}", service.name());
        if service.load().await {
            info!("Using metadata service: {}", service.name());
            return Ok(service);
        }
        if let Err(e) = service.cleanup().await {
            warn!("Failed to clean up {}: {}", service.name(), e);
        }
    }

    Err(FirstbootError::NoMetadataService)
}

/// Build the configured services and return the first that loads
pub async fn detect_metadata_service(
    config: &Config,
    deps: &ServiceDeps,
) -> Result<Box<dyn MetadataService>, FirstbootError> {
    let mut candidates = Vec::new();
    for kind in &config.metadata_services {
        match build_service(*kind, config, deps) {
            Ok(service) => candidates.push(service),
            Err(e) => warn!("Cannot create metadata service {}: {}", kind, e),
        }
    }

    select_service(candidates).await
}
