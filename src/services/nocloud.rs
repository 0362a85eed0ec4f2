//! NoCloud configuration drive
//!
//! A drive labelled `cidata` carrying a `meta-data` YAML document and a raw
//! `user-data` file.

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::MetadataService;
use super::drive::DriveService;
use crate::FirstbootError;
use crate::config::DriveSearchOptions;
use crate::osutils::drives::{ConfigDriveFlavor, ConfigDriveManager};

const META_DATA_PATH: &str = "meta-data";
const USER_DATA_PATH: &str = "user-data";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoCloudMetadata {
    #[serde(rename = "instance-id", default)]
    pub instance_id: Option<String>,
    #[serde(rename = "local-hostname", default)]
    pub local_hostname: Option<String>,
    #[serde(rename = "public-keys", default)]
    pub public_keys: Option<PublicKeys>,
}

/// `public-keys` may be a single key, a list, or a map of named keys
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PublicKeys {
    Single(String),
    List(Vec<String>),
    Named(BTreeMap<String, Value>),
}

impl PublicKeys {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Single(key) => vec![key.trim().to_string()],
            Self::List(keys) => keys.iter().map(|k| k.trim().to_string()).collect(),
            Self::Named(named) => {
                let mut keys = Vec::new();
                for value in named.values() {
                    collect_strings(value, &mut keys);
                }
                keys
            }
        }
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.trim().to_string()),
        Value::Sequence(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Mapping(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl NoCloudMetadata {
    /// Parse a `meta-data` document; an empty document is an empty mapping
    pub fn parse(raw: &str) -> Result<Self, FirstbootError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_yaml::from_str::<Value>(raw)? {
            Value::Null => Ok(Self::default()),
            value => Ok(serde_yaml::from_value(value)?),
        }
    }
}

pub struct NoCloudConfigDriveService {
    drive: DriveService,
    meta_data: Option<NoCloudMetadata>,
}

impl NoCloudConfigDriveService {
    pub fn new(options: &DriveSearchOptions, manager: Arc<dyn ConfigDriveManager>) -> Self {
        Self {
            drive: DriveService::new(
                "NoCloudConfigDrive",
                ConfigDriveFlavor::NoCloud,
                options,
                manager,
            ),
            meta_data: None,
        }
    }

    async fn meta_data(&mut self) -> Result<&NoCloudMetadata, FirstbootError> {
        if self.meta_data.is_none() {
            let parsed = match self.drive.read_file(META_DATA_PATH, true).await {
                Ok(data) => NoCloudMetadata::parse(&data.into_text())?,
                Err(FirstbootError::NotFound(path)) => {
                    debug!("No meta-data document at {}", path);
                    NoCloudMetadata::default()
                }
                Err(e) => return Err(e),
            };
            self.meta_data = Some(parsed);
        }
        Ok(self.meta_data.get_or_insert_with(NoCloudMetadata::default))
    }
}

#[async_trait]
impl MetadataService for NoCloudConfigDriveService {
    fn name(&self) -> &'static str {
        "NoCloudConfigDrive"
    }

    async fn load(&mut self) -> bool {
        self.drive.load().await
    }

    async fn get_instance_id(&mut self) -> Result<String, FirstbootError> {
        self.meta_data()
            .await?
            .instance_id
            .clone()
            .ok_or_else(|| FirstbootError::NotFound("instance-id".to_string()))
    }

    async fn get_host_name(&mut self) -> Result<String, FirstbootError> {
        self.meta_data()
            .await?
            .local_hostname
            .clone()
            .ok_or_else(|| FirstbootError::NotFound("local-hostname".to_string()))
    }

    async fn get_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        Ok(self
            .meta_data()
            .await?
            .public_keys
            .as_ref()
            .map(PublicKeys::to_vec)
            .unwrap_or_default())
    }

    async fn get_user_data(&mut self) -> Result<Vec<u8>, FirstbootError> {
        Ok(self.drive.read_file(USER_DATA_PATH, false).await?.into_bytes())
    }

    async fn cleanup(&mut self) -> Result<(), FirstbootError> {
        self.meta_data = None;
        self.drive.cleanup()
    }
}
