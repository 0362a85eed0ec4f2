//! Plugin execution state
//!
//! A plugin that finished with `Done` is recorded per instance, so later
//! boots of the same instance skip it:
//!
//! ```text
//! <state_dir>/instances/<instance-id>/sem/<plugin>
//! <state_dir>/data/instance-id
//! ```

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::FirstbootError;

/// Persistent per-instance record of completed plugins
#[derive(Debug, Clone)]
pub struct PluginStateStore {
    base: PathBuf,
    instance_id: String,
}

impl PluginStateStore {
    /// Open the store for `instance_id`, creating its directories.
    ///
    /// Also records the instance id as the current one and logs when it
    /// differs from the previous boot.
    pub async fn open(base: impl AsRef<Path>, instance_id: &str) -> Result<Self, FirstbootError> {
        if instance_id.is_empty() || instance_id.contains(['/', '\\']) || instance_id == ".." {
            return Err(FirstbootError::InvalidData(format!(
                "unusable instance id {instance_id:?}"
            )));
        }

        let store = Self {
            base: base.as_ref().to_path_buf(),
            instance_id: instance_id.to_string(),
        };
        fs::create_dir_all(store.sem_dir()).await?;
        fs::create_dir_all(store.data_dir()).await?;

        let cached = store.data_dir().join("instance-id");
        let previous = fs::read_to_string(&cached).await.ok();
        if previous.as_deref().map(str::trim) != Some(instance_id) {
            info!("New instance detected: {}", instance_id);
            fs::write(&cached, instance_id).await?;
        }

        Ok(store)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    /// `<base>/instances/<id>/sem`
    pub fn sem_dir(&self) -> PathBuf {
        self.base
            .join("instances")
            .join(&self.instance_id)
            .join("sem")
    }

    fn sem_path(&self, plugin: &str) -> PathBuf {
        self.sem_dir().join(plugin)
    }

    pub async fn is_done(&self, plugin: &str) -> bool {
        let path = self.sem_path(plugin);
        let done = fs::try_exists(&path).await.unwrap_or(false);
        debug!(
            "State check for {}: {} -> {}",
            plugin,
            path.display(),
            if done { "skip" } else { "run" }
        );
        done
    }

    pub async fn mark_done(&self, plugin: &str) -> Result<(), FirstbootError> {
        let path = self.sem_path(plugin);
        fs::create_dir_all(self.sem_dir()).await?;
        fs::write(&path, b"done").await?;
        debug!("Recorded plugin state: {}", path.display());
        Ok(())
    }

    /// Forget a plugin so it runs again on the next boot
    pub async fn clear(&self, plugin: &str) -> Result<(), FirstbootError> {
        match fs::remove_file(self.sem_path(plugin)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Plugins recorded as done, sorted
    pub async fn list(&self) -> Result<Vec<String>, FirstbootError> {
        let mut done = Vec::new();
        let mut entries = fs::read_dir(self.sem_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                done.push(name.to_string());
            }
        }
        done.sort();
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mark_and_check() {
        let temp = TempDir::new().unwrap();
        let store = PluginStateStore::open(temp.path(), "i-12345").await.unwrap();

        assert!(!store.is_done("cloudconfig").await);
        store.mark_done("cloudconfig").await.unwrap();
        assert!(store.is_done("cloudconfig").await);
        assert!(temp.path().join("instances/i-12345/sem/cloudconfig").exists());

        store.clear("cloudconfig").await.unwrap();
        assert!(!store.is_done("cloudconfig").await);
        store.clear("cloudconfig").await.unwrap();
    }

    #[tokio::test]
    async fn test_state_is_per_instance() {
        let temp = TempDir::new().unwrap();
        let first = PluginStateStore::open(temp.path(), "i-old").await.unwrap();
        first.mark_done("finalize").await.unwrap();

        let second = PluginStateStore::open(temp.path(), "i-new").await.unwrap();
        assert!(!second.is_done("finalize").await);

        let cached = std::fs::read_to_string(temp.path().join("data/instance-id")).unwrap();
        assert_eq!(cached, "i-new");
    }

    #[tokio::test]
    async fn test_list() {
        let temp = TempDir::new().unwrap();
        let store = PluginStateStore::open(temp.path(), "i-1").await.unwrap();
        store.mark_done("setserviceuser").await.unwrap();
        store.mark_done("finalize").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["finalize", "setserviceuser"]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_instance_id() {
        let temp = TempDir::new().unwrap();
        assert!(PluginStateStore::open(temp.path(), "../etc").await.is_err());
        assert!(PluginStateStore::open(temp.path(), "").await.is_err());
    }
}
