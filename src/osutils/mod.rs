//! Operating system primitives used by metadata services and plugins
//!
//! The core only talks to the host through [`OsUtils`], [`dhcp::DhcpOptionSource`]
//! and [`drives::ConfigDriveManager`], so tests can swap them out.

pub mod dhcp;
pub mod drives;

use async_trait::async_trait;
use rand::Rng;
use std::path::PathBuf;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::FirstbootError;

/// Host operations needed during provisioning
#[async_trait]
pub trait OsUtils: Send + Sync {
    /// Mount points of the attached logical drives
    async fn get_logical_drives(&self) -> Result<Vec<PathBuf>, FirstbootError>;

    /// Short host name, or the fully qualified one when `fqdn` is set
    async fn get_hostname(&self, fqdn: bool) -> Result<String, FirstbootError>;

    fn get_maximum_password_length(&self) -> usize;

    fn generate_random_password(&self, length: usize) -> String;

    async fn set_user_password(&self, username: &str, password: &str)
    -> Result<(), FirstbootError>;

    async fn check_service_exists(&self, service_name: &str) -> Result<bool, FirstbootError>;

    /// Run `service_name` as `username`
    async fn set_service_credentials(
        &self,
        service_name: &str,
        username: &str,
        password: &str,
    ) -> Result<(), FirstbootError>;

    /// Make sure the metadata address in `url` is reachable from this host
    async fn check_metadata_ip_route(&self, url: &str) -> Result<(), FirstbootError>;
}

/// Characters used for generated passwords
const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*()-_=+";

/// Generate a password from the OS-seeded thread generator, with at least one
/// upper case letter, one lower case letter and one digit when `length >= 3`.
pub fn random_password(length: usize) -> String {
    let mut rng = rand::rng();
    loop {
        let password: String = (0..length)
            .map(|_| PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())] as char)
            .collect();

        let complex = password.chars().any(|c| c.is_ascii_uppercase())
            && password.chars().any(|c| c.is_ascii_lowercase())
            && password.chars().any(|c| c.is_ascii_digit());
        if complex || length < 3 {
            return password;
        }
    }
}

/// [`OsUtils`] for a Linux guest
pub struct HostOsUtils {
    mounts_file: PathBuf,
    systemd_dir: PathBuf,
}

impl HostOsUtils {
    pub fn new() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/mounts"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
        }
    }

    async fn command_output(program: &str, args: &[&str]) -> Result<String, FirstbootError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| FirstbootError::OsUtils(format!("{program}: {e}")))?;

        if !output.status.success() {
            return Err(FirstbootError::OsUtils(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for HostOsUtils {
    fn default() -> Self {
        Self::new()
    }
}

/// Mount points of removable-media style filesystems listed in `/proc/mounts`
pub fn parse_logical_drives(mounts: &str) -> Vec<PathBuf> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let is_drive = device.starts_with("/dev/")
                && matches!(fs_type, "iso9660" | "udf" | "vfat" | "ntfs" | "ext4" | "xfs");
            is_drive.then(|| PathBuf::from(mount_point.replace("\\040", " ")))
        })
        .collect()
}

#[async_trait]
impl OsUtils for HostOsUtils {
    async fn get_logical_drives(&self) -> Result<Vec<PathBuf>, FirstbootError> {
        let mounts = fs::read_to_string(&self.mounts_file).await?;
        Ok(parse_logical_drives(&mounts))
    }

    async fn get_hostname(&self, fqdn: bool) -> Result<String, FirstbootError> {
        if fqdn {
            return Self::command_output("hostname", &["-f"]).await;
        }
        let hostname = fs::read_to_string("/proc/sys/kernel/hostname").await?;
        Ok(hostname.trim().to_string())
    }

    fn get_maximum_password_length(&self) -> usize {
        20
    }

    fn generate_random_password(&self, length: usize) -> String {
        random_password(length)
    }

    async fn set_user_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), FirstbootError> {
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("chpasswd")
            .stdin(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| FirstbootError::OsUtils(format!("chpasswd: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{username}:{password}\n").as_bytes())
                .await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(FirstbootError::OsUtils(format!(
                "chpasswd failed for user {username}"
            )));
        }
        Ok(())
    }

    async fn check_service_exists(&self, service_name: &str) -> Result<bool, FirstbootError> {
        let status = Command::new("systemctl")
            .args(["cat", "--", service_name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| FirstbootError::OsUtils(format!("systemctl: {e}")))?;
        Ok(status.success())
    }

    async fn set_service_credentials(
        &self,
        service_name: &str,
        username: &str,
        _password: &str,
    ) -> Result<(), FirstbootError> {
        // systemd services run under an account, the password is not needed
        let unit = if service_name.contains('.') {
            service_name.to_string()
        } else {
            format!("{service_name}.service")
        };
        let dropin_dir = self.systemd_dir.join(format!("{unit}.d"));
        fs::create_dir_all(&dropin_dir).await?;
        fs::write(
            dropin_dir.join("50-firstboot-user.conf"),
            format!("[Service]\nUser={username}\n"),
        )
        .await?;

        if let Err(e) = Self::command_output("systemctl", &["daemon-reload"]).await {
            warn!("Failed to reload systemd units: {}", e);
        }
        Ok(())
    }

    async fn check_metadata_ip_route(&self, url: &str) -> Result<(), FirstbootError> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| FirstbootError::Config(format!("invalid metadata URL {url}")))?;

        if host.parse::<std::net::Ipv4Addr>().is_err() {
            debug!("Metadata host {} is not an IPv4 address", host);
            return Ok(());
        }

        let route = Self::command_output("ip", &["route", "get", &host]).await?;
        debug!("Route to metadata address {}: {}", host, route);
        Ok(())
    }
}
