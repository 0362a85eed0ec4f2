//! firstboot-rs configuration
//!
//! One explicit configuration struct, handed to each metadata service and
//! plugin constructor. Option groups mirror the metadata services that use
//! them.

pub mod loader;

pub use loader::{DEFAULT_CONFIG_PATH, load_config};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::http::TlsOptions;
use crate::osutils::drives::{DriveLocation, DriveType};
use crate::retry::{DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL, Retry};

/// Metadata services that can be probed, in configuration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    ConfigDrive,
    NoCloud,
    Ec2,
    Azure,
    Packet,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigDrive => write!(f, "configdrive"),
            Self::NoCloud => write!(f, "nocloud"),
            Self::Ec2 => write!(f, "ec2"),
            Self::Azure => write!(f, "azure"),
            Self::Packet => write!(f, "packet"),
        }
    }
}

/// Plugins that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    SetServiceUser,
    CloudConfig,
    Finalize,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Services to probe, first successful load wins
    pub metadata_services: Vec<ServiceKind>,

    /// Plugins to run; each declares its own stage
    pub plugins: Vec<PluginKind>,

    /// Retries for metadata requests
    pub retry_count: u32,

    /// Seconds between two metadata request attempts
    pub retry_count_interval: u64,

    /// Attempts for the phone_home cloud-config directive when `tries` is unset
    pub phone_home_retries: u32,

    /// Where plugin execution state is recorded
    pub state_dir: PathBuf,

    /// Account assigned to `service_name` by the setserviceuser plugin
    pub service_username: Option<String>,

    /// Service whose account is set by the setserviceuser plugin
    pub service_name: Option<String>,

    pub ec2: Ec2Options,
    pub packet: PacketOptions,
    pub config_drive: DriveSearchOptions,
    pub nocloud: DriveSearchOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_services: vec![
                ServiceKind::ConfigDrive,
                ServiceKind::NoCloud,
                ServiceKind::Ec2,
                ServiceKind::Packet,
            ],
            plugins: vec![
                PluginKind::SetServiceUser,
                PluginKind::CloudConfig,
                PluginKind::Finalize,
            ],
            retry_count: DEFAULT_RETRY_COUNT,
            retry_count_interval: DEFAULT_RETRY_INTERVAL.as_secs(),
            phone_home_retries: 10,
            state_dir: PathBuf::from("/var/lib/firstboot"),
            service_username: None,
            service_name: None,
            ec2: Ec2Options::default(),
            packet: PacketOptions::default(),
            config_drive: DriveSearchOptions::default(),
            nocloud: DriveSearchOptions::default(),
        }
    }
}

impl Config {
    /// Retry policy for metadata requests
    pub fn retry(&self) -> Retry {
        Retry::new(
            self.retry_count,
            Duration::from_secs(self.retry_count_interval),
        )
    }
}

/// `ec2` option group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ec2Options {
    /// The base URL where the service looks for metadata
    pub metadata_base_url: String,
    /// Check that the metadata address is routable before probing
    pub add_metadata_private_ip_route: bool,
}

impl Default for Ec2Options {
    fn default() -> Self {
        Self {
            metadata_base_url: "http://169.254.169.254/".to_string(),
            add_metadata_private_ip_route: true,
        }
    }
}

/// `packet` option group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketOptions {
    pub metadata_url: String,
    pub https_allow_insecure: bool,
    /// PEM bundle used to verify the metadata endpoint
    pub local_certificate: Option<PathBuf>,
}

impl Default for PacketOptions {
    fn default() -> Self {
        Self {
            metadata_url: "https://metadata.packet.net/".to_string(),
            https_allow_insecure: false,
            local_certificate: None,
        }
    }
}

impl PacketOptions {
    pub fn tls(&self) -> TlsOptions {
        TlsOptions {
            https_allow_insecure: self.https_allow_insecure,
            https_ca_bundle: self.local_certificate.clone(),
        }
    }
}

/// `config_drive` / `nocloud` option groups
///
/// `raw_hdd`, `cdrom` and `vfat` are legacy shortcuts that are unioned into
/// `types` and `locations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSearchOptions {
    /// Look for an ISO config drive in raw HDDs
    pub raw_hdd: bool,
    /// Look for a config drive in the attached cdrom drives
    pub cdrom: bool,
    /// Look for a config drive in VFAT filesystems
    pub vfat: bool,
    /// Supported formats of a configuration drive
    pub types: Vec<DriveType>,
    /// Supported configuration drive locations
    pub locations: Vec<DriveLocation>,
}

impl Default for DriveSearchOptions {
    fn default() -> Self {
        Self {
            raw_hdd: true,
            cdrom: true,
            vfat: true,
            types: DriveType::ALL.to_vec(),
            locations: DriveLocation::ALL.to_vec(),
        }
    }
}

impl DriveSearchOptions {
    /// Options with every shortcut off and empty lists
    pub fn none() -> Self {
        Self {
            raw_hdd: false,
            cdrom: false,
            vfat: false,
            types: Vec::new(),
            locations: Vec::new(),
        }
    }
}
