//! Configuration drive discovery
//!
//! A config drive is searched for across drive types (ISO9660, VFAT) and
//! locations (optical drives, whole disks, partitions). The manager hands
//! back a directory holding the extracted drive contents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::FirstbootError;
use crate::config::DriveSearchOptions;

/// Filesystem format of a configuration drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Iso,
    Vfat,
}

impl DriveType {
    pub const ALL: [DriveType; 2] = [DriveType::Iso, DriveType::Vfat];

    /// Map a `blkid` TYPE value
    pub fn from_fs_type(fs_type: &str) -> Option<Self> {
        match fs_type {
            "iso9660" => Some(Self::Iso),
            "vfat" => Some(Self::Vfat),
            _ => None,
        }
    }

    fn mount_type(&self) -> &'static str {
        match self {
            Self::Iso => "iso9660",
            Self::Vfat => "vfat",
        }
    }
}

/// Where a configuration drive may be attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveLocation {
    Cdrom,
    Hdd,
    Partition,
}

impl DriveLocation {
    pub const ALL: [DriveLocation; 3] = [
        DriveLocation::Cdrom,
        DriveLocation::Hdd,
        DriveLocation::Partition,
    ];
}

/// Accepted drive types and locations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveSearch {
    pub types: BTreeSet<DriveType>,
    pub locations: BTreeSet<DriveLocation>,
}

impl DriveSearch {
    /// Union the explicit lists with the legacy boolean shortcuts:
    /// `raw_hdd` adds (iso, hdd), `cdrom` adds (iso, cdrom) and `vfat` adds
    /// (vfat, hdd).
    pub fn from_options(options: &DriveSearchOptions) -> Self {
        let mut types: BTreeSet<DriveType> = options.types.iter().copied().collect();
        let mut locations: BTreeSet<DriveLocation> = options.locations.iter().copied().collect();

        if options.raw_hdd {
            types.insert(DriveType::Iso);
            locations.insert(DriveLocation::Hdd);
        }
        if options.cdrom {
            types.insert(DriveType::Iso);
            locations.insert(DriveLocation::Cdrom);
        }
        if options.vfat {
            types.insert(DriveType::Vfat);
            locations.insert(DriveLocation::Hdd);
        }

        Self { types, locations }
    }

    /// Every accepted (type, location) pair
    pub fn pairs(&self) -> BTreeSet<(DriveType, DriveLocation)> {
        self.types
            .iter()
            .flat_map(|t| self.locations.iter().map(move |l| (*t, *l)))
            .collect()
    }

    pub fn accepts(&self, drive_type: DriveType, location: DriveLocation) -> bool {
        self.types.contains(&drive_type) && self.locations.contains(&location)
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() || self.locations.is_empty()
    }
}

/// Layout of the drive contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDriveFlavor {
    /// OpenStack `openstack/latest/*.json` layout, label `config-2`
    OpenStack,
    /// NoCloud `meta-data` / `user-data` layout, label `cidata`
    NoCloud,
}

impl ConfigDriveFlavor {
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            Self::OpenStack => &["config-2", "CONFIG-2"],
            Self::NoCloud => &["cidata", "CIDATA"],
        }
    }
}

impl std::fmt::Display for ConfigDriveFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenStack => write!(f, "config_drive"),
            Self::NoCloud => write!(f, "no_cloud_config_drive"),
        }
    }
}

/// Locates a configuration drive and extracts its files.
#[async_trait]
pub trait ConfigDriveManager: Send + Sync {
    /// Search the accepted drives and extract the first match into
    /// `target`. Returns false when no drive was found.
    async fn get_config_drive_files(
        &self,
        search: &DriveSearch,
        flavor: ConfigDriveFlavor,
        target: &Path,
    ) -> Result<bool, FirstbootError>;
}

/// Finds drives by filesystem label under `/dev/disk/by-label`
pub struct LabelConfigDriveManager {
    by_label_dir: PathBuf,
    sys_block_dir: PathBuf,
}

impl LabelConfigDriveManager {
    pub fn new() -> Self {
        Self {
            by_label_dir: PathBuf::from("/dev/disk/by-label"),
            sys_block_dir: PathBuf::from("/sys/class/block"),
        }
    }

    /// Classify a block device as optical drive, whole disk or partition
    async fn location_of(&self, device: &Path) -> DriveLocation {
        let name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name.starts_with("sr") {
            return DriveLocation::Cdrom;
        }
        if fs::metadata(self.sys_block_dir.join(&name).join("partition"))
            .await
            .is_ok()
        {
            return DriveLocation::Partition;
        }
        DriveLocation::Hdd
    }

    async fn type_of(device: &Path) -> Option<DriveType> {
        let output = Command::new("blkid")
            .args(["-o", "value", "-s", "TYPE"])
            .arg(device)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        DriveType::from_fs_type(String::from_utf8_lossy(&output.stdout).trim())
    }

    async fn extract(
        device: &Path,
        drive_type: DriveType,
        target: &Path,
    ) -> Result<(), FirstbootError> {
        let mount_point = tempfile::Builder::new()
            .prefix("firstboot-cd")
            .tempdir()?;

        run_command(
            Command::new("mount")
                .args(["-o", "ro", "-t", drive_type.mount_type()])
                .arg(device)
                .arg(mount_point.path()),
        )
        .await?;

        let copied = copy_dir(mount_point.path(), target).await;

        if let Err(e) = run_command(Command::new("umount").arg(mount_point.path())).await {
            warn!("Failed to unmount {}: {}", mount_point.path().display(), e);
        }

        copied
    }
}

impl Default for LabelConfigDriveManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigDriveManager for LabelConfigDriveManager {
    async fn get_config_drive_files(
        &self,
        search: &DriveSearch,
        flavor: ConfigDriveFlavor,
        target: &Path,
    ) -> Result<bool, FirstbootError> {
        if search.is_empty() {
            debug!("Config drive search set is empty");
            return Ok(false);
        }

        for label in flavor.labels() {
            let link = self.by_label_dir.join(label);
            let Ok(device) = fs::canonicalize(&link).await else {
                continue;
            };

            let location = self.location_of(&device).await;
            let Some(drive_type) = Self::type_of(&device).await else {
                debug!("Unrecognized filesystem on {}", device.display());
                continue;
            };

            if !search.accepts(drive_type, location) {
                debug!(
                    "Skipping {} ({:?} on {:?}): not in search set",
                    device.display(),
                    drive_type,
                    location
                );
                continue;
            }

            info!(
                "Found {} drive {} ({:?} on {:?})",
                flavor,
                device.display(),
                drive_type,
                location
            );
            Self::extract(&device, drive_type, target).await?;
            return Ok(true);
        }

        Ok(false)
    }
}

async fn run_command(command: &mut Command) -> Result<(), FirstbootError> {
    let output = command
        .output()
        .await
        .map_err(|e| FirstbootError::OsUtils(e.to_string()))?;

    if !output.status.success() {
        return Err(FirstbootError::OsUtils(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Recursively copy `src` into `dst`
pub async fn copy_dir(src: &Path, dst: &Path) -> Result<(), FirstbootError> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dest = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), dest));
            } else if file_type.is_file() {
                fs::copy(entry.path(), &dest).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(search: &DriveSearch) -> Vec<(DriveType, DriveLocation)> {
        search.pairs().into_iter().collect()
    }

    #[test]
    fn test_raw_hdd_only() {
        let options = DriveSearchOptions {
            raw_hdd: true,
            ..DriveSearchOptions::none()
        };
        let search = DriveSearch::from_options(&options);
        assert_eq!(pairs(&search), vec![(DriveType::Iso, DriveLocation::Hdd)]);
    }

    #[test]
    fn test_cdrom_only() {
        let options = DriveSearchOptions {
            cdrom: true,
            ..DriveSearchOptions::none()
        };
        let search = DriveSearch::from_options(&options);
        assert_eq!(pairs(&search), vec![(DriveType::Iso, DriveLocation::Cdrom)]);
    }

    #[test]
    fn test_vfat_only() {
        let options = DriveSearchOptions {
            vfat: true,
            ..DriveSearchOptions::none()
        };
        let search = DriveSearch::from_options(&options);
        assert_eq!(pairs(&search), vec![(DriveType::Vfat, DriveLocation::Hdd)]);
    }

    #[test]
    fn test_explicit_lists_union_with_flags() {
        let options = DriveSearchOptions {
            cdrom: true,
            types: vec![DriveType::Vfat],
            locations: vec![DriveLocation::Partition],
            ..DriveSearchOptions::none()
        };
        let search = DriveSearch::from_options(&options);
        assert_eq!(
            search.types,
            BTreeSet::from([DriveType::Iso, DriveType::Vfat])
        );
        assert_eq!(
            search.locations,
            BTreeSet::from([DriveLocation::Cdrom, DriveLocation::Partition])
        );
        assert!(search.accepts(DriveType::Vfat, DriveLocation::Cdrom));
        assert!(!search.accepts(DriveType::Iso, DriveLocation::Hdd));
    }

    #[test]
    fn test_nothing_enabled_is_empty() {
        let search = DriveSearch::from_options(&DriveSearchOptions::none());
        assert!(search.is_empty());
        assert!(search.pairs().is_empty());
    }

    #[test]
    fn test_defaults_accept_everything() {
        let search = DriveSearch::from_options(&DriveSearchOptions::default());
        assert_eq!(search.pairs().len(), 6);
    }

    #[test]
    fn test_from_fs_type() {
        assert_eq!(DriveType::from_fs_type("iso9660"), Some(DriveType::Iso));
        assert_eq!(DriveType::from_fs_type("vfat"), Some(DriveType::Vfat));
        assert_eq!(DriveType::from_fs_type("ext4"), None);
    }

    #[tokio::test]
    async fn test_copy_dir_recursive() {
        let src = tempfile::TempDir::new().unwrap();
        let dst = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("openstack/latest")).unwrap();
        std::fs::write(src.path().join("openstack/latest/meta_data.json"), "{}").unwrap();
        std::fs::write(src.path().join("top"), "x").unwrap();

        copy_dir(src.path(), dst.path()).await.unwrap();

        assert!(dst.path().join("openstack/latest/meta_data.json").exists());
        assert!(dst.path().join("top").exists());
    }

    #[tokio::test]
    async fn test_label_manager_without_labels_finds_nothing() {
        let empty = tempfile::TempDir::new().unwrap();
        let manager = LabelConfigDriveManager {
            by_label_dir: empty.path().to_path_buf(),
            sys_block_dir: empty.path().to_path_buf(),
        };
        let target = tempfile::TempDir::new().unwrap();

        let found = manager
            .get_config_drive_files(
                &DriveSearch::from_options(&DriveSearchOptions::default()),
                ConfigDriveFlavor::NoCloud,
                target.path(),
            )
            .await
            .unwrap();
        assert!(!found);
    }
}
