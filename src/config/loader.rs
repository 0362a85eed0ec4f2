//! Configuration loader
//!
//! Loads the main configuration file and its drop-in directory
//! (`<stem>.d/*.yaml`, applied in alphabetical order).

use super::Config;
use crate::FirstbootError;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Default location of the main configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/firstboot/firstboot.yaml";

/// Load configuration, falling back to defaults when nothing is present
pub async fn load_config(path: Option<&Path>) -> Result<Config, FirstbootError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    let mut merged = Value::Mapping(Default::default());

    if let Some(value) = load_config_file(path).await? {
        debug!("Loaded config from {}", path.display());
        merge_values(&mut merged, value);
    }

    for value in load_dropin_configs(&dropin_dir(path)).await? {
        merge_values(&mut merged, value);
    }

    serde_yaml::from_value(merged)
        .map_err(|e| FirstbootError::Config(format!("invalid configuration: {e}")))
}

/// `/etc/firstboot/firstboot.yaml` -> `/etc/firstboot/firstboot.d`
fn dropin_dir(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firstboot".to_string());
    path.with_file_name(format!("{stem}.d"))
}

/// Load a single YAML file; an empty file counts as absent
async fn load_config_file(path: impl AsRef<Path>) -> Result<Option<Value>, FirstbootError> {
    let path = path.as_ref();

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_yaml::from_str(&content)
        .map_err(|e| FirstbootError::Config(format!("failed to parse {}: {e}", path.display())))?;

    match value {
        Value::Null => Ok(None),
        Value::Mapping(_) => Ok(Some(value)),
        _ => Err(FirstbootError::Config(format!(
            "{} must contain a mapping",
            path.display()
        ))),
    }
}

/// Load all drop-in configs from a directory (sorted alphabetically)
async fn load_dropin_configs(dir: impl AsRef<Path>) -> Result<Vec<Value>, FirstbootError> {
    let dir = dir.as_ref();

    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            entries.push(path);
        }
    }

    entries.sort();

    let mut values = Vec::new();
    for path in entries {
        if let Some(value) = load_config_file(&path).await? {
            debug!("Loaded drop-in config from {}", path.display());
            values.push(value);
        }
    }

    info!("Loaded {} drop-in configs", values.len());
    Ok(values)
}

/// Deep-merge `overlay` into `base`. Mappings merge key by key, anything
/// else is replaced.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
