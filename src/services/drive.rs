//! Shared plumbing for the services backed by a configuration drive
//!
//! The drive contents are extracted into a private temporary directory on
//! load and read from there afterwards.

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::FirstbootError;
use crate::cache::{CachedData, MetadataCache};
use crate::config::DriveSearchOptions;
use crate::osutils::drives::{ConfigDriveFlavor, ConfigDriveManager, DriveSearch};

pub struct DriveService {
    name: &'static str,
    flavor: ConfigDriveFlavor,
    search: DriveSearch,
    manager: Arc<dyn ConfigDriveManager>,
    target: Option<TempDir>,
    cache: MetadataCache<CachedData>,
}

impl DriveService {
    pub fn new(
        name: &'static str,
        flavor: ConfigDriveFlavor,
        options: &DriveSearchOptions,
        manager: Arc<dyn ConfigDriveManager>,
    ) -> Self {
        Self {
            name,
            flavor,
            search: DriveSearch::from_options(options),
            manager,
            target: None,
            cache: MetadataCache::new(),
        }
    }

    pub fn search(&self) -> &DriveSearch {
        &self.search
    }

    pub fn is_loaded(&self) -> bool {
        self.target.is_some()
    }

    /// Directory holding the extracted drive, once loaded
    pub fn target_path(&self) -> Option<&Path> {
        self.target.as_ref().map(TempDir::path)
    }

    pub fn ensure_loaded(&self) -> Result<&Path, FirstbootError> {
        self.target_path().ok_or(FirstbootError::NotLoaded(self.name))
    }

    /// Look for a drive of this flavor and extract it
    pub async fn load(&mut self) -> bool {
        let target = match tempfile::Builder::new().prefix("firstboot-drive").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot create a directory for {}: {}", self.flavor, e);
                return false;
            }
        };

        match self
            .manager
            .get_config_drive_files(&self.search, self.flavor, target.path())
            .await
        {
            Ok(true) => {
                info!("Metadata copied to folder: {}", target.path().display());
                self.target = Some(target);
                true
            }
            Ok(false) => {
                debug!("No {} drive found", self.flavor);
                false
            }
            Err(e) => {
                warn!("Failed to get {} drive files: {}", self.flavor, e);
                false
            }
        }
    }

    /// Cached read of a file relative to the extracted drive root
    pub async fn read_file(
        &mut self,
        path: &str,
        decode: bool,
    ) -> Result<CachedData, FirstbootError> {
        let full_path = self.ensure_loaded()?.join(path);
        self.cache
            .get_or_fetch(path, decode, || async move {
                match fs::read(&full_path).await {
                    Ok(bytes) => Ok(CachedData::from_bytes(bytes, decode)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(FirstbootError::NotFound(full_path.display().to_string()))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Remove the extracted drive contents
    pub fn cleanup(&mut self) -> Result<(), FirstbootError> {
        self.cache.clear();
        if let Some(target) = self.target.take() {
            debug!("Deleting metadata folder: {}", target.path().display());
            target.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DirectoryDriveManager;

    fn drive_service(source: &Path) -> DriveService {
        DriveService::new(
            "test-drive",
            ConfigDriveFlavor::NoCloud,
            &DriveSearchOptions::default(),
            Arc::new(DirectoryDriveManager::new(source)),
        )
    }

    #[tokio::test]
    async fn test_read_before_load_fails() {
        let source = TempDir::new().unwrap();
        let mut service = drive_service(source.path());
        let result = service.read_file("meta-data", true).await;
        assert!(matches!(result, Err(FirstbootError::NotLoaded("test-drive"))));
    }

    #[tokio::test]
    async fn test_load_read_and_cleanup() {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("meta-data"), "instance-id: i-1\n").unwrap();

        let mut service = drive_service(source.path());
        assert!(service.load().await);
        let target = service.target_path().unwrap().to_path_buf();
        assert!(target.join("meta-data").exists());

        let data = service.read_file("meta-data", true).await.unwrap();
        assert_eq!(data.into_text(), "instance-id: i-1\n");

        // served from the cache even after the source changes
        std::fs::remove_file(target.join("meta-data")).unwrap();
        assert!(service.read_file("meta-data", true).await.is_ok());

        let missing = service.read_file("user-data", false).await;
        assert!(matches!(missing, Err(FirstbootError::NotFound(_))));

        service.cleanup().unwrap();
        assert!(!target.exists());
        assert!(!service.is_loaded());
    }

    #[tokio::test]
    async fn test_empty_search_does_not_load() {
        let source = TempDir::new().unwrap();
        let mut service = DriveService::new(
            "test-drive",
            ConfigDriveFlavor::OpenStack,
            &DriveSearchOptions::none(),
            Arc::new(DirectoryDriveManager::new(source.path())),
        );
        assert!(!service.load().await);
        assert!(service.target_path().is_none());
    }
}
