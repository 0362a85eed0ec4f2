//! DHCP option lookup from the local lease files
//!
//! Only options the DHCP client did not know how to decode are collected
//! (`option unknown-245 a8:3f:81:10;` in dhclient leases, `OPTION_245=A83F8110`
//! in systemd-networkd leases), keyed by option code.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use crate::FirstbootError;

pub type DhcpOptions = HashMap<u8, Vec<u8>>;

/// Source of the options received in the last DHCP negotiation
#[async_trait]
pub trait DhcpOptionSource: Send + Sync {
    async fn get_dhcp_options(&self) -> Result<DhcpOptions, FirstbootError>;
}

/// Reads dhclient and systemd-networkd lease files
pub struct LeaseFileDhcpSource {
    lease_dirs: Vec<PathBuf>,
}

impl LeaseFileDhcpSource {
    pub fn new() -> Self {
        Self {
            lease_dirs: vec![
                PathBuf::from("/var/lib/dhcp"),
                PathBuf::from("/var/lib/dhclient"),
                PathBuf::from("/var/lib/NetworkManager"),
                PathBuf::from("/run/systemd/netif/leases"),
            ],
        }
    }

    pub fn with_dirs(lease_dirs: Vec<PathBuf>) -> Self {
        Self { lease_dirs }
    }
}

impl Default for LeaseFileDhcpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DhcpOptionSource for LeaseFileDhcpSource {
    async fn get_dhcp_options(&self) -> Result<DhcpOptions, FirstbootError> {
        let mut options = DhcpOptions::new();

        for dir in &self.lease_dirs {
            let Ok(mut entries) = fs::read_dir(dir).await else {
                continue;
            };

            let mut files = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                files.push(entry.path());
            }
            files.sort();

            for path in files {
                let Ok(content) = fs::read_to_string(&path).await else {
                    continue;
                };
                let parsed = if content.contains("lease {") {
                    parse_dhclient_leases(&content)
                } else {
                    parse_networkd_lease(&content)
                };
                if !parsed.is_empty() {
                    debug!("Found {} DHCP options in {}", parsed.len(), path.display());
                }
                options.extend(parsed);
            }
        }

        Ok(options)
    }
}

/// Parse `option unknown-<code> <hex:hex:...>;` lines. Later leases win.
pub fn parse_dhclient_leases(content: &str) -> DhcpOptions {
    let mut options = DhcpOptions::new();

    for line in content.lines() {
        let Some(rest) = line.trim().strip_prefix("option unknown-") else {
            continue;
        };
        let rest = rest.trim_end_matches(';');
        let Some((code, value)) = rest.split_once(char::is_whitespace) else {
            continue;
        };
        let (Ok(code), Some(bytes)) = (code.parse::<u8>(), parse_hex(value.trim(), ':')) else {
            continue;
        };
        options.insert(code, bytes);
    }

    options
}

/// Parse `OPTION_<code>=<HEX>` lines of a networkd lease
pub fn parse_networkd_lease(content: &str) -> DhcpOptions {
    let mut options = DhcpOptions::new();

    for line in content.lines() {
        let Some(rest) = line.trim().strip_prefix("OPTION_") else {
            continue;
        };
        let Some((code, value)) = rest.split_once('=') else {
            continue;
        };
        let (Ok(code), Some(bytes)) = (code.parse::<u8>(), parse_hex(value.trim(), '\0')) else {
            continue;
        };
        options.insert(code, bytes);
    }

    options
}

/// Decode hex, either separated by `sep` ("a8:3f") or contiguous ("A83F")
fn parse_hex(value: &str, sep: char) -> Option<Vec<u8>> {
    if value.contains(sep) {
        return value
            .split(sep)
            .map(|b| u8::from_str_radix(b, 16).ok())
            .collect();
    }

    if value.is_empty() || value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| value.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DHCLIENT_LEASES: &str = r#"lease {
  interface "eth0";
  fixed-address 10.0.0.4;
  option subnet-mask 255.255.255.0;
  option unknown-245 a8:3f:81:10;
  option dhcp-lease-time 4294967295;
}
lease {
  interface "eth0";
  fixed-address 10.0.0.4;
  option unknown-245 a8:3f:81:11;
}
"#;

    #[test]
    fn test_parse_dhclient_last_lease_wins() {
        let options = parse_dhclient_leases(DHCLIENT_LEASES);
        assert_eq!(options.get(&245), Some(&vec![0xa8, 0x3f, 0x81, 0x11]));
        assert_eq!(options.len(), 1);
    }

    #[test]
    fn test_parse_networkd_lease() {
        let lease = "ADDRESS=10.0.0.4\nOPTION_245=A83F8110\nOPTION_bad=zz\n";
        let options = parse_networkd_lease(lease);
        assert_eq!(options.get(&245), Some(&vec![0xa8, 0x3f, 0x81, 0x10]));
        assert_eq!(options.len(), 1);
    }

    #[test]
    fn test_parse_hex_rejects_garbage() {
        assert_eq!(parse_hex("a8:zz", ':'), None);
        assert_eq!(parse_hex("ABC", '\0'), None);
        assert_eq!(parse_hex("", '\0'), None);
    }

    #[tokio::test]
    async fn test_lease_file_source_reads_directories() {
        let dhclient = TempDir::new().unwrap();
        let networkd = TempDir::new().unwrap();
        std::fs::write(dhclient.path().join("dhclient.eth0.leases"), DHCLIENT_LEASES).unwrap();
        std::fs::write(networkd.path().join("2"), "OPTION_245=A83F8112\n").unwrap();

        let source = LeaseFileDhcpSource::with_dirs(vec![
            dhclient.path().to_path_buf(),
            networkd.path().to_path_buf(),
            PathBuf::from("/nonexistent/leases"),
        ]);

        let options = source.get_dhcp_options().await.unwrap();
        assert_eq!(options.get(&245), Some(&vec![0xa8, 0x3f, 0x81, 0x12]));
    }
}
