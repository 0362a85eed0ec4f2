//! Per-service memoization of metadata lookups

use std::collections::HashMap;
use std::future::Future;

/// Raw or decoded metadata as fetched from a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedData {
    Bytes(Vec<u8>),
    Text(String),
}

impl CachedData {
    /// Build a value from fetched bytes, decoding to text when asked to
    pub fn from_bytes(bytes: Vec<u8>, decode: bool) -> Self {
        if decode {
            match String::from_utf8(bytes) {
                Ok(text) => Self::Text(text),
                Err(e) => Self::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            }
        } else {
            Self::Bytes(bytes)
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Self::Text(text) => text,
        }
    }
}

/// Cache keyed by request path and decode flag.
///
/// A key is fetched at most once per cache. Failed fetches are not stored,
/// so a later call tries again.
#[derive(Debug)]
pub struct MetadataCache<V> {
    entries: HashMap<(String, bool), V>,
}

impl<V> Default for MetadataCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V: Clone> MetadataCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str, decode: bool) -> Option<&V> {
        self.entries.get(&(path.to_string(), decode))
    }

    pub fn contains(&self, path: &str, decode: bool) -> bool {
        self.entries.contains_key(&(path.to_string(), decode))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Return the cached value or run `fetch` and store its result
    pub async fn get_or_fetch<E, F, Fut>(
        &mut self,
        path: &str,
        decode: bool,
        fetch: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let key = (path.to_string(), decode);
        if let Some(value) = self.entries.get(&key) {
            return Ok(value.clone());
        }

        let value = fetch().await?;
        self.entries.insert(key, value.clone());
        Ok(value)
    }
}
