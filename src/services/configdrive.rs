//! OpenStack configuration drive
//!
//! Reads `openstack/latest/meta_data.json` and `openstack/latest/user_data`
//! from a drive labelled `config-2`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::MetadataService;
use super::drive::DriveService;
use crate::FirstbootError;
use crate::config::DriveSearchOptions;
use crate::osutils::drives::{ConfigDriveFlavor, ConfigDriveManager};

const META_DATA_PATH: &str = "openstack/latest/meta_data.json";
const USER_DATA_PATH: &str = "openstack/latest/user_data";

/// `meta_data.json` fields used by the plugins
#[derive(Debug, Clone, Deserialize)]
pub struct OpenStackMetadata {
    pub uuid: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub public_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub keys: Vec<OpenStackKey>,
    #[serde(default)]
    pub admin_pass: Option<String>,
    #[serde(default)]
    pub meta: Option<OpenStackMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenStackKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub data: String,
}

/// User supplied `meta` properties
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenStackMeta {
    #[serde(default)]
    pub admin_pass: Option<String>,
}

impl OpenStackMetadata {
    /// Keys from the `public_keys` map followed by `ssh` entries of `keys`,
    /// without duplicates
    pub fn ssh_public_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let candidates = self.public_keys.values().chain(
            self.keys
                .iter()
                .filter(|k| k.key_type == "ssh")
                .map(|k| &k.data),
        );
        for key in candidates {
            let key = key.trim().to_string();
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    pub fn admin_password(&self) -> Option<String> {
        self.admin_pass
            .clone()
            .or_else(|| self.meta.as_ref().and_then(|m| m.admin_pass.clone()))
    }
}

pub struct ConfigDriveService {
    drive: DriveService,
    meta_data: Option<OpenStackMetadata>,
}

impl ConfigDriveService {
    pub fn new(options: &DriveSearchOptions, manager: Arc<dyn ConfigDriveManager>) -> Self {
        Self {
            drive: DriveService::new(
                "ConfigDrive",
                ConfigDriveFlavor::OpenStack,
                options,
                manager,
            ),
            meta_data: None,
        }
    }

    async fn meta_data(&mut self) -> Result<&OpenStackMetadata, FirstbootError> {
        if self.meta_data.is_none() {
            let raw = self.drive.read_file(META_DATA_PATH, true).await?.into_text();
            self.meta_data = Some(serde_json::from_str(&raw)?);
        }
        self.meta_data
            .as_ref()
            .ok_or_else(|| FirstbootError::NotFound(META_DATA_PATH.to_string()))
    }
}

#[async_trait]
impl MetadataService for ConfigDriveService {
    fn name(&self) -> &'static str {
        "ConfigDrive"
    }

    async fn load(&mut self) -> bool {
        self.drive.load().await
    }

    async fn get_instance_id(&mut self) -> Result<String, FirstbootError> {
        Ok(self.meta_data().await?.uuid.clone())
    }

    async fn get_host_name(&mut self) -> Result<String, FirstbootError> {
        self.meta_data()
            .await?
            .hostname
            .clone()
            .ok_or_else(|| FirstbootError::NotFound("hostname".to_string()))
    }

    async fn get_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        Ok(self.meta_data().await?.ssh_public_keys())
    }

    async fn get_user_data(&mut self) -> Result<Vec<u8>, FirstbootError> {
        Ok(self.drive.read_file(USER_DATA_PATH, false).await?.into_bytes())
    }

    async fn get_admin_password(&mut self) -> Result<Option<String>, FirstbootError> {
        Ok(self.meta_data().await?.admin_password())
    }

    async fn cleanup(&mut self) -> Result<(), FirstbootError> {
        self.meta_data = None;
        self.drive.cleanup()
    }
}
