//! Test doubles for the host and for metadata services
//!
//! Used by the unit tests and by the integration tests under `tests/`.
//!
//! # Example
//! ```
//! use firstboot_rs::testing::MockService;
//!
//! let service = MockService::new()
//!     .with_instance_id("i-123")
//!     .with_user_data(b"#cloud-config\n");
//! ```

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::FirstbootError;
use crate::osutils::OsUtils;
use crate::osutils::dhcp::{DhcpOptionSource, DhcpOptions};
use crate::osutils::drives::{
    ConfigDriveFlavor, ConfigDriveManager, DriveLocation, DriveSearch, DriveType, copy_dir,
};
use crate::plugins::{Plugin, PluginOutcome, PluginStatus, SharedData, Stage};
use crate::services::MetadataService;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of calls made on a double, shared with the test
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn record(&self, event: &str) {
        lock(&self.0).push(event.to_string());
    }

    pub fn contains(&self, event: &str) -> bool {
        lock(&self.0).iter().any(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        lock(&self.0).iter().filter(|e| *e == event).count()
    }

    pub fn list(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

/// Configurable [`MetadataService`]
pub struct MockService {
    name: &'static str,
    loadable: bool,
    loaded: bool,
    instance_id: Option<String>,
    host_name: Option<String>,
    public_keys: Vec<String>,
    user_data: Option<Vec<u8>>,
    admin_password: Option<String>,
    finalize: bool,
    finalize_error: Option<String>,
    events: EventLog,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            name: "Mock",
            loadable: true,
            loaded: false,
            instance_id: Some("mock-instance".to_string()),
            host_name: Some("mock-host".to_string()),
            public_keys: Vec::new(),
            user_data: None,
            admin_password: None,
            finalize: false,
            finalize_error: None,
            events: EventLog::default(),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set what `load` returns
    pub fn with_loadable(mut self, loadable: bool) -> Self {
        self.loadable = loadable;
        self
    }

    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    pub fn with_host_name(mut self, host_name: &str) -> Self {
        self.host_name = Some(host_name.to_string());
        self
    }

    pub fn with_public_keys(mut self, keys: &[&str]) -> Self {
        self.public_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_user_data(mut self, user_data: &[u8]) -> Self {
        self.user_data = Some(user_data.to_vec());
        self
    }

    pub fn with_admin_password(mut self, password: &str) -> Self {
        self.admin_password = Some(password.to_string());
        self
    }

    /// Advertise a finalize action
    pub fn with_finalize(mut self, finalize: bool) -> Self {
        self.finalize = finalize;
        self
    }

    pub fn with_finalize_error(mut self, error: &str) -> Self {
        self.finalize = true;
        self.finalize_error = Some(error.to_string());
        self
    }

    /// Handle on the calls made to this service
    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    fn ensure_loaded(&self) -> Result<(), FirstbootError> {
        if self.loaded {
            Ok(())
        } else {
            Err(FirstbootError::NotLoaded(self.name))
        }
    }

    fn value<T: Clone>(&self, value: &Option<T>, key: &str) -> Result<T, FirstbootError> {
        self.ensure_loaded()?;
        value
            .clone()
            .ok_or_else(|| FirstbootError::NotFound(key.to_string()))
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataService for MockService {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn load(&mut self) -> bool {
        self.events.record("load");
        self.loaded = self.loadable;
        self.loaded
    }

    async fn get_instance_id(&mut self) -> Result<String, FirstbootError> {
        self.value(&self.instance_id, "instance-id")
    }

    async fn get_host_name(&mut self) -> Result<String, FirstbootError> {
        self.value(&self.host_name, "hostname")
    }

    async fn get_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        self.ensure_loaded()?;
        Ok(self.public_keys.clone())
    }

    async fn get_user_data(&mut self) -> Result<Vec<u8>, FirstbootError> {
        self.value(&self.user_data, "user-data")
    }

    async fn get_admin_password(&mut self) -> Result<Option<String>, FirstbootError> {
        self.ensure_loaded()?;
        Ok(self.admin_password.clone())
    }

    async fn provisioning_started(&mut self) -> Result<(), FirstbootError> {
        self.events.record("provisioning_started");
        Ok(())
    }

    async fn provisioning_completed(&mut self) -> Result<(), FirstbootError> {
        self.events.record("provisioning_completed");
        Ok(())
    }

    async fn provisioning_failed(&mut self) -> Result<(), FirstbootError> {
        self.events.record("provisioning_failed");
        Ok(())
    }

    fn supports_finalize(&self) -> bool {
        self.finalize
    }

    async fn on_finalize(&mut self) -> Result<(), FirstbootError> {
        self.events.record("on_finalize");
        match &self.finalize_error {
            Some(error) => Err(FirstbootError::Protocol(error.clone())),
            None => Ok(()),
        }
    }

    async fn cleanup(&mut self) -> Result<(), FirstbootError> {
        self.events.record("cleanup");
        Ok(())
    }
}

/// [`OsUtils`] that records what it is asked to do
pub struct MockOsUtils {
    hostname: String,
    fqdn: String,
    max_password_length: usize,
    services: HashSet<String>,
    logical_drives: Vec<PathBuf>,
    passwords: Mutex<Vec<(String, String)>>,
    service_credentials: Mutex<Vec<(String, String, String)>>,
    route_checks: Mutex<Vec<String>>,
}

impl MockOsUtils {
    pub fn new() -> Self {
        Self {
            hostname: "localhost".to_string(),
            fqdn: "localhost.localdomain".to_string(),
            max_password_length: 20,
            services: HashSet::new(),
            logical_drives: Vec::new(),
            passwords: Mutex::new(Vec::new()),
            service_credentials: Mutex::new(Vec::new()),
            route_checks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_hostname(mut self, hostname: &str, fqdn: &str) -> Self {
        self.hostname = hostname.to_string();
        self.fqdn = fqdn.to_string();
        self
    }

    /// Declare an existing service
    pub fn with_service(mut self, service: &str) -> Self {
        self.services.insert(service.to_string());
        self
    }

    pub fn with_logical_drive(mut self, path: impl AsRef<Path>) -> Self {
        self.logical_drives.push(path.as_ref().to_path_buf());
        self
    }

    /// `(username, password)` pairs set so far
    pub fn passwords(&self) -> Vec<(String, String)> {
        lock(&self.passwords).clone()
    }

    /// `(service, username, password)` assignments made so far
    pub fn service_credentials(&self) -> Vec<(String, String, String)> {
        lock(&self.service_credentials).clone()
    }

    pub fn route_checks(&self) -> Vec<String> {
        lock(&self.route_checks).clone()
    }
}

impl Default for MockOsUtils {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OsUtils for MockOsUtils {
    async fn get_logical_drives(&self) -> Result<Vec<PathBuf>, FirstbootError> {
        Ok(self.logical_drives.clone())
    }

    async fn get_hostname(&self, fqdn: bool) -> Result<String, FirstbootError> {
        Ok(if fqdn {
            self.fqdn.clone()
        } else {
            self.hostname.clone()
        })
    }

    fn get_maximum_password_length(&self) -> usize {
        self.max_password_length
    }

    fn generate_random_password(&self, length: usize) -> String {
        crate::osutils::random_password(length)
    }

    async fn set_user_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), FirstbootError> {
        lock(&self.passwords).push((username.to_string(), password.to_string()));
        Ok(())
    }

    async fn check_service_exists(&self, service_name: &str) -> Result<bool, FirstbootError> {
        Ok(self.services.contains(service_name))
    }

    async fn set_service_credentials(
        &self,
        service_name: &str,
        username: &str,
        password: &str,
    ) -> Result<(), FirstbootError> {
        lock(&self.service_credentials).push((
            service_name.to_string(),
            username.to_string(),
            password.to_string(),
        ));
        Ok(())
    }

    async fn check_metadata_ip_route(&self, url: &str) -> Result<(), FirstbootError> {
        lock(&self.route_checks).push(url.to_string());
        Ok(())
    }
}

/// DHCP source with fixed options, counting how often it is queried
#[derive(Default)]
pub struct StaticDhcpSource {
    options: DhcpOptions,
    calls: AtomicUsize,
}

impl StaticDhcpSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_option(mut self, code: u8, value: Vec<u8>) -> Self {
        self.options.insert(code, value);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DhcpOptionSource for StaticDhcpSource {
    async fn get_dhcp_options(&self) -> Result<DhcpOptions, FirstbootError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.options.clone())
    }
}

/// Serves a local directory as a configuration drive
///
/// The drive pretends to be an ISO in a cdrom unless told otherwise, and is
/// only found when the search accepts that combination.
pub struct DirectoryDriveManager {
    source: PathBuf,
    drive_type: DriveType,
    location: DriveLocation,
    flavor: Option<ConfigDriveFlavor>,
}

impl DirectoryDriveManager {
    pub fn new(source: impl AsRef<Path>) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            drive_type: DriveType::Iso,
            location: DriveLocation::Cdrom,
            flavor: None,
        }
    }

    pub fn with_drive(mut self, drive_type: DriveType, location: DriveLocation) -> Self {
        self.drive_type = drive_type;
        self.location = location;
        self
    }

    /// Only answer searches for this flavor
    pub fn with_flavor(mut self, flavor: ConfigDriveFlavor) -> Self {
        self.flavor = Some(flavor);
        self
    }
}

#[async_trait]
impl ConfigDriveManager for DirectoryDriveManager {
    async fn get_config_drive_files(
        &self,
        search: &DriveSearch,
        flavor: ConfigDriveFlavor,
        target: &Path,
    ) -> Result<bool, FirstbootError> {
        if self.flavor.is_some_and(|f| f != flavor)
            || !search.accepts(self.drive_type, self.location)
            || !tokio::fs::try_exists(&self.source).await.unwrap_or(false)
        {
            return Ok(false);
        }
        copy_dir(&self.source, target).await?;
        Ok(true)
    }
}

/// Plugin returning a fixed outcome
pub struct MockPlugin {
    name: &'static str,
    stage: Stage,
    outcome: PluginOutcome,
    error: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl MockPlugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stage: Stage::Main,
            outcome: PluginOutcome::done(),
            error: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_status(mut self, status: PluginStatus) -> Self {
        self.outcome.status = status;
        self
    }

    pub fn with_reboot(mut self, reboot_required: bool) -> Self {
        self.outcome.reboot_required = reboot_required;
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Shared execution counter
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn name(&self) -> &'static str {
        self.name
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(
        &self,
        _service: &mut dyn MetadataService,
        _shared: &mut SharedData,
    ) -> Result<PluginOutcome, FirstbootError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.error {
            Some(error) => Err(FirstbootError::plugin(self.name, error.clone())),
            None => Ok(self.outcome.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveSearchOptions;

    #[tokio::test]
    async fn test_mock_service_requires_load() {
        let mut service = MockService::new().with_instance_id("i-1");
        assert!(matches!(
            service.get_instance_id().await,
            Err(FirstbootError::NotLoaded("Mock"))
        ));
        assert!(service.load().await);
        assert_eq!(service.get_instance_id().await.unwrap(), "i-1");
        assert!(service.get_user_data().await.unwrap_err().is_not_found());
        assert_eq!(service.events().list(), vec!["load"]);
    }

    #[tokio::test]
    async fn test_directory_drive_respects_search() {
        let source = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let manager = DirectoryDriveManager::new(source.path())
            .with_drive(DriveType::Vfat, DriveLocation::Partition);

        let raw_hdd_only = DriveSearch::from_options(&DriveSearchOptions {
            raw_hdd: true,
            ..DriveSearchOptions::none()
        });
        assert!(
            !manager
                .get_config_drive_files(&raw_hdd_only, ConfigDriveFlavor::NoCloud, target.path())
                .await
                .unwrap()
        );

        let everything = DriveSearch::from_options(&DriveSearchOptions::default());
        assert!(
            manager
                .get_config_drive_files(&everything, ConfigDriveFlavor::NoCloud, target.path())
                .await
                .unwrap()
        );
    }
}
