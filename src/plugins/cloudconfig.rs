//! `#cloud-config` user data
//!
//! Only the `phone_home` directive is acted upon: once the instance is up,
//! POST a JSON document describing it to a URL of the user's choosing.
//!
//! ```yaml
//! #cloud-config
//! phone_home:
//!   url: http://example.com/$INSTANCE_ID/
//!   post: [instance_id, hostname]
//!   tries: 10
//! ```

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Plugin, PluginOutcome, SharedData};
use crate::FirstbootError;
use crate::http::{HttpTransport, TlsOptions};
use crate::osutils::OsUtils;
use crate::retry::Retry;
use crate::services::MetadataService;

const CLOUD_CONFIG_HEADER: &str = "#cloud-config";
const INSTANCE_ID_PLACEHOLDER: &str = "$INSTANCE_ID";

/// The subset of cloud-config this plugin understands
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub phone_home: Option<PhoneHomeConfig>,
}

impl CloudConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, FirstbootError> {
        if yaml.trim().is_empty() || yaml.trim() == CLOUD_CONFIG_HEADER {
            return Ok(Self::default());
        }
        match serde_yaml::from_str::<serde_yaml::Value>(yaml)? {
            serde_yaml::Value::Null => Ok(Self::default()),
            value => Ok(serde_yaml::from_value(value)?),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhoneHomeConfig {
    #[serde(default)]
    pub url: Option<String>,
    /// `all` or a list of keys; all keys when absent
    #[serde(default)]
    pub post: Option<PostSpec>,
    /// Total number of attempts
    #[serde(default)]
    pub tries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PostSpec {
    Keyword(String),
    Keys(Vec<String>),
}

/// Values that can be posted home
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneHomeKey {
    InstanceId,
    Hostname,
    Fqdn,
}

impl PhoneHomeKey {
    pub const ALL: [PhoneHomeKey; 3] = [Self::InstanceId, Self::Hostname, Self::Fqdn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceId => "instance_id",
            Self::Hostname => "hostname",
            Self::Fqdn => "fqdn",
        }
    }

    fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

impl PhoneHomeConfig {
    /// Keys to post, in the order they were requested
    pub fn post_keys(&self) -> Result<Vec<PhoneHomeKey>, FirstbootError> {
        match &self.post {
            None => Ok(PhoneHomeKey::ALL.to_vec()),
            Some(PostSpec::Keyword(keyword)) if keyword == "all" => Ok(PhoneHomeKey::ALL.to_vec()),
            Some(PostSpec::Keyword(other)) => Err(FirstbootError::InvalidData(format!(
                "phone_home post must be 'all' or a list, got {other:?}"
            ))),
            Some(PostSpec::Keys(keys)) => Ok(keys
                .iter()
                .filter_map(|key| {
                    let parsed = PhoneHomeKey::parse(key);
                    if parsed.is_none() {
                        warn!("Unknown phone_home post key: {}", key);
                    }
                    parsed
                })
                .collect()),
        }
    }
}

/// Decompress gzip user data; anything else is returned unchanged
pub fn decompress_if_needed(data: &[u8]) -> Result<Vec<u8>, FirstbootError> {
    if data.starts_with(&[0x1f, 0x8b]) {
        debug!("Decompressing gzip user-data");
        let mut decompressed = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut decompressed)
            .map_err(|e| FirstbootError::InvalidData(format!("Gzip decompression failed: {e}")))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

pub struct CloudConfigPlugin {
    default_tries: u32,
    retry_interval: Duration,
    os: Arc<dyn OsUtils>,
}

impl CloudConfigPlugin {
    pub fn new(default_tries: u32, retry_interval: Duration, os: Arc<dyn OsUtils>) -> Self {
        Self {
            default_tries,
            retry_interval,
            os,
        }
    }

    async fn phone_home(
        &self,
        config: &PhoneHomeConfig,
        service: &mut dyn MetadataService,
    ) -> Result<(), FirstbootError> {
        let Some(url) = &config.url else {
            warn!("Phone home url not present. Insufficient data to phone home.");
            return Ok(());
        };

        let keys = config.post_keys()?;
        let mut instance_id = None;
        if url.contains(INSTANCE_ID_PLACEHOLDER) || keys.contains(&PhoneHomeKey::InstanceId) {
            instance_id = Some(service.get_instance_id().await?);
        }

        let mut body = serde_json::Map::new();
        for key in &keys {
            let value = match key {
                PhoneHomeKey::InstanceId => instance_id.clone().unwrap_or_default(),
                PhoneHomeKey::Hostname => self.os.get_hostname(false).await?,
                PhoneHomeKey::Fqdn => self.os.get_hostname(true).await?,
            };
            body.insert(key.as_str().to_string(), serde_json::Value::String(value));
        }

        let url = match &instance_id {
            Some(id) => url.replace(INSTANCE_ID_PLACEHOLDER, id),
            None => url.clone(),
        };
        let tries = config.tries.unwrap_or(self.default_tries).max(1);
        let retry = Retry::new(tries - 1, self.retry_interval);

        info!("Calling home to url {} with data {:?}", url, body);
        let http = HttpTransport::new(None, &TlsOptions::default())?;
        let payload = serde_json::to_vec(&body)?;
        let headers = [("Content-Type".to_string(), "application/json".to_string())];
        retry
            .exec_if(
                || http.request(&url, Some(payload.clone()), &headers, None),
                FirstbootError::is_transient,
            )
            .await
            .inspect_err(|e| warn!("Failed to call home to {}: {}", url, e))?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for CloudConfigPlugin {
    fn name(&self) -> &'static str {
        "cloudconfig"
    }

    async fn execute(
        &self,
        service: &mut dyn MetadataService,
        _shared: &mut SharedData,
    ) -> Result<PluginOutcome, FirstbootError> {
        let user_data = match service.get_user_data().await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                debug!("User data not found");
                return Ok(PluginOutcome::done());
            }
            Err(e) => return Err(e),
        };

        let user_data = decompress_if_needed(&user_data)?;
        let text = String::from_utf8_lossy(&user_data);
        if !text.trim_start().starts_with(CLOUD_CONFIG_HEADER) {
            debug!("User data is not cloud-config, nothing to do");
            return Ok(PluginOutcome::done());
        }

        let config = CloudConfig::from_yaml(&text)?;
        if let Some(phone_home) = &config.phone_home {
            self.phone_home(phone_home, service).await?;
        }

        Ok(PluginOutcome::done())
    }
}
