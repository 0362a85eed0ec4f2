//! Packet (Equinix Metal) metadata service
//!
//! The whole `metadata` JSON document and the raw `userdata` are fetched on
//! load; accessors then walk the document by path.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::MetadataService;
use crate::FirstbootError;
use crate::cache::MetadataCache;
use crate::config::Config;
use crate::http::{HttpTransport, TlsOptions};
use crate::retry::Retry;

/// Result of a metadata path lookup
#[derive(Debug, Clone, PartialEq)]
pub enum PathValue {
    /// Raw `userdata`
    Bytes(Vec<u8>),
    Scalar(Value),
    /// Number of items of an array or object
    Count(usize),
}

impl PathValue {
    /// Text form of a scalar; strings are returned without quotes
    pub fn into_text(self) -> Result<String, FirstbootError> {
        match self {
            Self::Scalar(Value::String(s)) => Ok(s),
            Self::Scalar(Value::Null) => Err(FirstbootError::NotFound("null value".to_string())),
            Self::Scalar(other) => Ok(other.to_string()),
            Self::Bytes(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Self::Count(n) => Err(FirstbootError::InvalidData(format!(
                "expected a value, found a container of {n} items"
            ))),
        }
    }
}

struct RawData {
    metadata: Value,
    userdata: Vec<u8>,
}

pub struct PacketService {
    http: HttpTransport,
    retry: Retry,
    cache: MetadataCache<PathValue>,
    raw: Option<RawData>,
}

impl PacketService {
    pub fn new(config: &Config) -> Result<Self, FirstbootError> {
        Self::with_base_url(
            &config.packet.metadata_url,
            &config.packet.tls(),
            config.retry(),
        )
    }

    pub fn with_base_url(
        base_url: &str,
        tls: &TlsOptions,
        retry: Retry,
    ) -> Result<Self, FirstbootError> {
        Ok(Self {
            http: HttpTransport::new(Some(base_url), tls)?,
            retry,
            cache: MetadataCache::new(),
            raw: None,
        })
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FirstbootError> {
        self.retry
            .exec_if(|| self.http.get(path), FirstbootError::is_transient)
            .await
    }

    /// Look up `metadata/<key>/...` or `userdata`.
    ///
    /// Empty segments are ignored and numeric segments index arrays. A
    /// container resolves to its item count.
    pub async fn get_data(&mut self, path: &str) -> Result<PathValue, FirstbootError> {
        let raw = self.raw.as_ref().ok_or(FirstbootError::NotLoaded("Packet"))?;
        self.cache
            .get_or_fetch(path, false, || async { walk(raw, path) })
            .await
    }

    async fn get_text(&mut self, path: &str) -> Result<String, FirstbootError> {
        self.get_data(path).await?.into_text()
    }

    async fn phone_home_url(&mut self) -> Result<String, FirstbootError> {
        self.get_text("metadata/phone_home_url").await
    }

    async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<(), FirstbootError> {
        let headers = [("Content-Type".to_string(), "application/json".to_string())];
        self.retry
            .exec_if(
                || self.http.request(url, Some(body.clone()), &headers, None),
                FirstbootError::is_transient,
            )
            .await?;
        Ok(())
    }
}

fn walk(raw: &RawData, path: &str) -> Result<PathValue, FirstbootError> {
    let not_found = || FirstbootError::NotFound(path.to_string());
    let mut segments = path.split('/').filter(|s| !s.is_empty());

    match segments.next() {
        Some("userdata") => {
            if segments.next().is_some() {
                return Err(not_found());
            }
            Ok(PathValue::Bytes(raw.userdata.clone()))
        }
        Some("metadata") => {
            let mut current = &raw.metadata;
            for segment in segments {
                let next = match current {
                    Value::Object(map) => map.get(segment),
                    Value::Array(items) => segment
                        .parse::<usize>()
                        .ok()
                        .and_then(|index| items.get(index)),
                    _ => None,
                };
                current = match next {
                    Some(value) => value,
                    None => {
                        debug!("The container {:?} does not exist in {}", segment, path);
                        return Err(not_found());
                    }
                };
            }
            Ok(match current {
                Value::Array(items) => PathValue::Count(items.len()),
                Value::Object(map) => PathValue::Count(map.len()),
                scalar => PathValue::Scalar(scalar.clone()),
            })
        }
        _ => Err(not_found()),
    }
}

#[async_trait]
impl MetadataService for PacketService {
    fn name(&self) -> &'static str {
        "Packet"
    }

    async fn load(&mut self) -> bool {
        let metadata = match self.fetch("metadata").await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Metadata not found at {:?}: {}", self.http.base_url(), e);
                return false;
            }
        };
        let userdata = match self.fetch("userdata").await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Userdata not found at {:?}: {}", self.http.base_url(), e);
                return false;
            }
        };

        match serde_json::from_slice(&metadata) {
            Ok(metadata) => {
                self.cache.clear();
                self.raw = Some(RawData { metadata, userdata });
                true
            }
            Err(e) => {
                warn!("Failed to load metadata: {}", e);
                false
            }
        }
    }

    async fn get_instance_id(&mut self) -> Result<String, FirstbootError> {
        self.get_text("metadata/id").await
    }

    async fn get_host_name(&mut self) -> Result<String, FirstbootError> {
        self.get_text("metadata/hostname").await
    }

    async fn get_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        let count = match self.get_data("metadata/ssh_keys").await? {
            PathValue::Count(n) => n,
            other => {
                return Err(FirstbootError::InvalidData(format!(
                    "ssh_keys is not a list: {other:?}"
                )));
            }
        };

        let mut keys = Vec::with_capacity(count);
        for index in 0..count {
            keys.push(self.get_text(&format!("metadata/ssh_keys/{index}")).await?);
        }
        Ok(keys)
    }

    async fn get_user_data(&mut self) -> Result<Vec<u8>, FirstbootError> {
        match self.get_data("userdata").await? {
            PathValue::Bytes(bytes) => Ok(bytes),
            other => Ok(other.into_text()?.into_bytes()),
        }
    }

    async fn get_encryption_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        let url = format!("{}/key", self.phone_home_url().await?.trim_end_matches('/'));
        let key = self.fetch(&url).await?;
        Ok(vec![String::from_utf8_lossy(&key).into_owned()])
    }

    fn can_post_password(&self) -> bool {
        true
    }

    async fn post_password(&mut self, enc_password_b64: &str) -> Result<bool, FirstbootError> {
        let url = self.phone_home_url().await?;
        let body = serde_json::to_vec(&serde_json::json!({ "password": enc_password_b64 }))?;
        self.post_json(&url, body).await.inspect_err(|e| {
            warn!("Failed to post password: {}", e);
        })?;
        Ok(true)
    }

    fn supports_finalize(&self) -> bool {
        true
    }

    /// Tell Packet the install completed: an empty POST to the phone-home URL
    async fn on_finalize(&mut self) -> Result<(), FirstbootError> {
        let url = self.phone_home_url().await?;
        info!("Calling home to: {}", url);
        self.retry
            .exec_if(
                || self.http.request(&url, Some(Vec::new()), &[], None),
                FirstbootError::is_transient,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> RawData {
        RawData {
            metadata: json!({
                "id": "e1f4b6ae",
                "hostname": "packet-host",
                "ssh_keys": ["a", "b"],
                "network": {"interfaces": [{"name": "eth0"}]},
                "phone_home_url": "https://tinkerbell.example/phone-home",
            }),
            userdata: b"#!/bin/sh\n".to_vec(),
        }
    }

    #[test]
    fn test_walk_containers_and_scalars() {
        let raw = raw();
        assert_eq!(walk(&raw, "metadata/ssh_keys").unwrap(), PathValue::Count(2));
        assert_eq!(
            walk(&raw, "metadata/ssh_keys/0").unwrap(),
            PathValue::Scalar(json!("a"))
        );
        assert_eq!(
            walk(&raw, "/metadata//network/interfaces/0/name/").unwrap(),
            PathValue::Scalar(json!("eth0"))
        );
        assert_eq!(walk(&raw, "metadata").unwrap(), PathValue::Count(5));
        assert_eq!(
            walk(&raw, "userdata").unwrap(),
            PathValue::Bytes(b"#!/bin/sh\n".to_vec())
        );
    }

    #[test]
    fn test_walk_missing_paths() {
        let raw = raw();
        for path in ["", "/", "metadata/nope", "metadata/ssh_keys/7", "other/id"] {
            assert!(
                matches!(walk(&raw, path), Err(FirstbootError::NotFound(_))),
                "path {path:?}"
            );
        }
    }

    #[test]
    fn test_path_value_text() {
        assert_eq!(
            PathValue::Scalar(json!("abc")).into_text().unwrap(),
            "abc"
        );
        assert_eq!(PathValue::Scalar(json!(42)).into_text().unwrap(), "42");
        assert!(PathValue::Count(2).into_text().is_err());
    }

    #[tokio::test]
    async fn test_get_data_before_load() {
        let mut service = PacketService::with_base_url(
            "http://127.0.0.1:9/",
            &TlsOptions::default(),
            Retry::disabled(),
        )
        .unwrap();
        assert!(matches!(
            service.get_data("metadata/id").await,
            Err(FirstbootError::NotLoaded("Packet"))
        ));
    }
}
