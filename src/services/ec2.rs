//! EC2 metadata service
//!
//! Walks the versioned `meta-data` tree served at the EC2 metadata address.
//! The same layout is served by several other clouds, which is why field
//! names are resolved through an alias table against the directory listing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::MetadataService;
use crate::FirstbootError;
use crate::cache::{CachedData, MetadataCache};
use crate::config::Config;
use crate::http::{HttpTransport, TlsOptions};
use crate::osutils::OsUtils;
use crate::retry::Retry;

/// Version of the metadata tree consumed by this service
pub const METADATA_VERSION: &str = "2009-04-04";

/// Logical metadata fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    HostName,
    InstanceId,
    PublicKeys,
}

impl Endpoint {
    const ALL: [Endpoint; 3] = [Endpoint::HostName, Endpoint::InstanceId, Endpoint::PublicKeys];

    /// Directory entries that can serve this field, in priority order
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::HostName => &["local-hostname", "hostname"],
            Self::InstanceId => &["instance-id"],
            Self::PublicKeys => &["public-keys"],
        }
    }
}

/// EC2 metadata service
pub struct Ec2Service {
    http: HttpTransport,
    retry: Retry,
    cache: MetadataCache<CachedData>,
    endpoints: Option<HashMap<Endpoint, &'static str>>,
    os: Arc<dyn OsUtils>,
    add_metadata_private_ip_route: bool,
    loaded: bool,
}

impl Ec2Service {
    pub fn new(config: &Config, os: Arc<dyn OsUtils>) -> Result<Self, FirstbootError> {
        Ok(Self {
            http: HttpTransport::new(Some(&config.ec2.metadata_base_url), &TlsOptions::default())?,
            retry: config.retry(),
            cache: MetadataCache::new(),
            endpoints: None,
            os,
            add_metadata_private_ip_route: config.ec2.add_metadata_private_ip_route,
            loaded: false,
        })
    }

    /// Create with a custom base URL (for testing)
    pub fn with_base_url(
        base_url: &str,
        retry: Retry,
        os: Arc<dyn OsUtils>,
    ) -> Result<Self, FirstbootError> {
        Ok(Self {
            http: HttpTransport::new(Some(base_url), &TlsOptions::default())?,
            retry,
            cache: MetadataCache::new(),
            endpoints: None,
            os,
            add_metadata_private_ip_route: false,
            loaded: false,
        })
    }

    fn ensure_loaded(&self) -> Result<(), FirstbootError> {
        if self.loaded {
            Ok(())
        } else {
            Err(FirstbootError::NotLoaded("EC2"))
        }
    }

    /// Cached GET of a path relative to the base URL
    async fn get_cache_data(
        &mut self,
        path: &str,
        decode: bool,
    ) -> Result<CachedData, FirstbootError> {
        let http = &self.http;
        let retry = &self.retry;
        self.cache
            .get_or_fetch(path, decode, || async move {
                let bytes = retry
                    .exec_if(|| http.get(path), FirstbootError::is_transient)
                    .await?;
                Ok(CachedData::from_bytes(bytes, decode))
            })
            .await
    }

    async fn get_text(&mut self, path: &str) -> Result<String, FirstbootError> {
        Ok(self.get_cache_data(path, true).await?.into_text())
    }

    fn meta_data_root() -> String {
        format!("{METADATA_VERSION}/meta-data/")
    }

    /// Check that the metadata root answers
    async fn test_api(&mut self) -> bool {
        match self.get_text(&Self::meta_data_root()).await {
            Ok(_) => {
                debug!(
                    "Metadata service {:?} responded properly",
                    self.http.base_url().map(|u| u.as_str())
                );
                true
            }
            Err(e) => {
                debug!(
                    "Metadata not found at URL {:?}: {}",
                    self.http.base_url().map(|u| u.as_str()),
                    e
                );
                false
            }
        }
    }

    /// Resolve every logical field against the directory listing, once
    async fn endpoints(&mut self) -> Result<&HashMap<Endpoint, &'static str>, FirstbootError> {
        if self.endpoints.is_none() {
            let listing = self.get_text(&Self::meta_data_root()).await?;
            self.endpoints = Some(resolve_endpoints(&listing));
        }
        Ok(self.endpoints.get_or_insert_with(HashMap::new))
    }

    async fn url_for(&mut self, endpoint: Endpoint) -> Result<String, FirstbootError> {
        let alias = self
            .endpoints()
            .await?
            .get(&endpoint)
            .copied()
            .ok_or_else(|| FirstbootError::NotFound(format!("{endpoint:?}")))?;
        Ok(format!("{METADATA_VERSION}/meta-data/{alias}"))
    }
}

/// Map each logical field to the first alias present in the listing
pub fn resolve_endpoints(listing: &str) -> HashMap<Endpoint, &'static str> {
    let entries: Vec<&str> = listing
        .lines()
        .map(|line| line.trim().trim_end_matches('/'))
        .collect();
    let mut endpoints = HashMap::new();

    for endpoint in Endpoint::ALL {
        match endpoint
            .aliases()
            .iter()
            .find(|alias| entries.contains(alias))
        {
            Some(alias) => {
                endpoints.insert(endpoint, *alias);
            }
            None => debug!("No endpoint available for {:?}", endpoint),
        }
    }

    endpoints
}

/// How one line of the `public-keys` listing is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyListing {
    /// `index=name`: fetch `public-keys/<index>/openssh-key`
    Index(String),
    /// A bare `ssh-rsa` key, kept verbatim
    Inline(String),
    Skip,
}

/// Only `<digits>=<name>` with a single `=` is an index entry; padded
/// base64 keys also contain `=`.
pub fn classify_key_line(line: &str) -> KeyListing {
    let line = line.trim();
    if let Some((index, name)) = line.split_once('=')
        && !name.contains('=')
        && !index.is_empty()
        && index.bytes().all(|b| b.is_ascii_digit())
    {
        return KeyListing::Index(index.to_string());
    }
    if line.starts_with("ssh-rsa") {
        KeyListing::Inline(line.to_string())
    } else {
        KeyListing::Skip
    }
}

#[async_trait]
impl MetadataService for Ec2Service {
    fn name(&self) -> &'static str {
        "EC2"
    }

    async fn load(&mut self) -> bool {
        if self.add_metadata_private_ip_route {
            let base = self.http.base_url().map(|u| u.to_string()).unwrap_or_default();
            if let Err(e) = self.os.check_metadata_ip_route(&base).await {
                warn!("Metadata route check failed: {}", e);
            }
        }

        self.loaded = self.test_api().await;
        self.loaded
    }

    async fn get_host_name(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        let url = self.url_for(Endpoint::HostName).await?;
        self.get_text(&url).await
    }

    async fn get_instance_id(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        let url = self.url_for(Endpoint::InstanceId).await?;
        self.get_text(&url).await
    }

    /// The listing holds `index=key-name` lines; each index is then fetched
    /// from `public-keys/<index>/openssh-key`.
    async fn get_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        self.ensure_loaded()?;
        let url = self.url_for(Endpoint::PublicKeys).await?;
        let listing = self.get_text(&url).await?;

        let mut keys = Vec::new();
        for line in listing.lines() {
            match classify_key_line(line) {
                KeyListing::Index(index) => {
                    let key_path =
                        format!("{METADATA_VERSION}/meta-data/public-keys/{index}/openssh-key");
                    keys.push(self.get_text(&key_path).await?.trim().to_string());
                }
                KeyListing::Inline(key) => keys.push(key),
                KeyListing::Skip => debug!("Failed to process the following key {:?}", line),
            }
        }

        Ok(keys)
    }

    async fn get_user_data(&mut self) -> Result<Vec<u8>, FirstbootError> {
        self.ensure_loaded()?;
        let path = format!("{METADATA_VERSION}/user-data");
        Ok(self.get_cache_data(&path, false).await?.into_bytes())
    }
}
