//! Error types for firstboot-rs

use thiserror::Error;

/// Main error type for firstboot-rs operations
#[derive(Error, Debug)]
pub enum FirstbootError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested metadata key or path does not exist in the backend
    #[error("Metadata not found: {0}")]
    NotFound(String),

    #[error("Metadata service '{0}' is not loaded")]
    NotLoaded(&'static str),

    #[error("No metadata service found")]
    NoMetadataService,

    /// Unsupported protocol version or unexpected protocol state
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request to {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML parsing error: {0}")]
    Xml(#[from] serde_xml_rs::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Plugin error in '{plugin}': {message}")]
    Plugin { plugin: String, message: String },

    #[error("OS utilities error: {0}")]
    OsUtils(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl FirstbootError {
    /// Create a plugin error
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Whether this error means "no value" rather than a hard failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether another attempt could succeed; missing metadata stays missing
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::NotLoaded(_))
    }
}
