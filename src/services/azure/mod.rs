//! Azure WireServer metadata service
//!
//! The WireServer address is handed out through DHCP option 245. Identity
//! comes from the goal state, provisioning data from the `ovf-env.xml`
//! file on the provisioning media, and health is reported back by POST.

pub mod xml;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use self::xml::{GoalState, HealthDetails, OvfEnvironment, Versions};
use super::MetadataService;
use crate::FirstbootError;
use crate::config::Config;
use crate::http::{HttpTransport, TlsOptions};
use crate::osutils::OsUtils;
use crate::osutils::dhcp::DhcpOptionSource;
use crate::retry::Retry;

pub const WIRESERVER_DHCP_OPTION: u8 = 245;
pub const WIRE_SERVER_VERSION: &str = "2015-04-05";

const GOAL_STATE_STARTED: &str = "Started";

const HEALTH_STATE_READY: &str = "Ready";
const HEALTH_STATE_NOT_READY: &str = "NotReady";
const HEALTH_SUBSTATE_PROVISIONING: &str = "Provisioning";
const HEALTH_SUBSTATE_PROVISIONING_FAILED: &str = "ProvisioningFailed";

const ROLE_PROPERTY_CERT_THUMB: &str = "CertificateThumbprint";

pub const OVF_ENV_DRIVE_TAG: &str = "E6DA6616-8EC4-48E0-BE93-58CE6ACE3CFB.tag";
pub const OVF_ENV_FILENAME: &str = "ovf-env.xml";

const AGENT_NAME: &str = "firstboot-rs";

/// Endpoint discovery polls DHCP for up to five minutes
const DISCOVERY_BUDGET: Duration = Duration::from_secs(300);
const DISCOVERY_POLL: Duration = Duration::from_secs(5);

pub struct AzureService {
    http: HttpTransport,
    retry: Retry,
    discovery_retry: Retry,
    os: Arc<dyn OsUtils>,
    dhcp: Arc<dyn DhcpOptionSource>,
    headers: Vec<(String, String)>,
    version_checked: bool,
    goal_state: Option<GoalState>,
    ovf_env: Option<OvfEnvironment>,
    loaded: bool,
}

impl AzureService {
    pub fn new(
        config: &Config,
        os: Arc<dyn OsUtils>,
        dhcp: Arc<dyn DhcpOptionSource>,
    ) -> Result<Self, FirstbootError> {
        Ok(Self {
            http: HttpTransport::new(None, &TlsOptions::default())?,
            retry: config.retry(),
            discovery_retry: Retry::from_budget(DISCOVERY_BUDGET, DISCOVERY_POLL),
            os,
            dhcp,
            headers: vec![("x-ms-guest-agent-name".to_string(), AGENT_NAME.to_string())],
            version_checked: false,
            goal_state: None,
            ovf_env: None,
            loaded: false,
        })
    }

    /// Override the request and endpoint discovery retry policies
    pub fn with_retries(mut self, retry: Retry, discovery_retry: Retry) -> Self {
        self.retry = retry;
        self.discovery_retry = discovery_retry;
        self
    }

    /// Use a fixed WireServer address instead of DHCP discovery
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, FirstbootError> {
        self.http.set_base_url(base_url)?;
        Ok(self)
    }

    fn ensure_loaded(&self) -> Result<(), FirstbootError> {
        if self.loaded {
            Ok(())
        } else {
            Err(FirstbootError::NotLoaded("Azure"))
        }
    }

    /// Read the WireServer address from DHCP option 245
    pub async fn discover_endpoint(&self) -> Result<Ipv4Addr, FirstbootError> {
        self.discovery_retry
            .exec(|| async {
                let options = self.dhcp.get_dhcp_options().await?;
                let value = options.get(&WIRESERVER_DHCP_OPTION).ok_or_else(|| {
                    FirstbootError::NotFound("Azure WireServer endpoint address".to_string())
                })?;
                endpoint_from_option(value)
            })
            .await
    }

    async fn wire_server_request(
        &self,
        path: &str,
        body: Option<String>,
    ) -> Result<Vec<u8>, FirstbootError> {
        let mut headers = self.headers.clone();
        if body.is_some() {
            headers.push((
                "Content-Type".to_string(),
                "text/xml; charset=utf-8".to_string(),
            ));
        }
        let body = body.map(String::into_bytes);

        self.retry
            .exec_if(
                || self.http.request(path, body.clone(), &headers, None),
                FirstbootError::is_transient,
            )
            .await
    }

    async fn wire_server_text(&self, path: &str) -> Result<String, FirstbootError> {
        let bytes = self.wire_server_request(path, None).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn check_version_header(&mut self) -> Result<(), FirstbootError> {
        if self.version_checked {
            return Ok(());
        }

        let versions: Versions = xml::parse(&self.wire_server_text("?comp=Versions").await?)?;
        if !versions.supports(WIRE_SERVER_VERSION) {
            return Err(FirstbootError::Protocol(format!(
                "Unsupported Azure WireServer version: {WIRE_SERVER_VERSION}"
            )));
        }

        self.headers
            .push(("x-ms-version".to_string(), WIRE_SERVER_VERSION.to_string()));
        self.version_checked = true;
        Ok(())
    }

    /// Current goal state; only a `Started` machine state is accepted
    async fn get_goal_state(&mut self, force_update: bool) -> Result<GoalState, FirstbootError> {
        if let Some(goal_state) = &self.goal_state
            && !force_update
        {
            return Ok(goal_state.clone());
        }

        let goal_state: GoalState =
            xml::parse(&self.wire_server_text("machine?comp=goalstate").await?)?;
        if goal_state.machine.expected_state != GOAL_STATE_STARTED {
            self.goal_state = None;
            return Err(FirstbootError::Protocol(format!(
                "Invalid machine expected state: {}",
                goal_state.machine.expected_state
            )));
        }

        self.goal_state = Some(goal_state.clone());
        Ok(goal_state)
    }

    async fn get_ovf_env_path(&self) -> Result<PathBuf, FirstbootError> {
        for base_path in self.os.get_logical_drives().await? {
            if !tokio::fs::try_exists(base_path.join(OVF_ENV_DRIVE_TAG))
                .await
                .unwrap_or(false)
            {
                continue;
            }

            let ovf_env_path = base_path.join(OVF_ENV_FILENAME);
            if !tokio::fs::try_exists(&ovf_env_path).await.unwrap_or(false) {
                return Err(FirstbootError::NotFound(format!(
                    "ovf-env path does not exist: {}",
                    ovf_env_path.display()
                )));
            }
            debug!("ovf-env path: {}", ovf_env_path.display());
            return Ok(ovf_env_path);
        }

        Err(FirstbootError::NotFound(format!(
            "No drive containing file {OVF_ENV_FILENAME} could be found"
        )))
    }

    async fn get_ovf_env(&mut self) -> Result<&OvfEnvironment, FirstbootError> {
        if self.ovf_env.is_none() {
            let path = self.get_ovf_env_path().await?;
            let content = tokio::fs::read_to_string(&path).await?;
            self.ovf_env = Some(xml::parse(&content)?);
        }
        self.ovf_env
            .as_ref()
            .ok_or_else(|| FirstbootError::NotFound(OVF_ENV_FILENAME.to_string()))
    }

    async fn load_documents(&mut self) -> Result<(), FirstbootError> {
        self.check_version_header().await?;
        self.get_goal_state(false).await?;
        self.get_ovf_env().await?;
        Ok(())
    }

    async fn post_health_status(
        &mut self,
        state: &str,
        details: Option<HealthDetails<'_>>,
    ) -> Result<(), FirstbootError> {
        self.ensure_loaded()?;
        let goal_state = self.get_goal_state(true).await?;
        let report = xml::health_report(
            &goal_state.incarnation,
            &goal_state.container.container_id,
            &goal_state.role_instance().instance_id,
            state,
            details,
        );
        debug!("Health data: {}", report);
        self.wire_server_request("machine?comp=health", Some(report))
            .await?;
        Ok(())
    }

    async fn post_role_properties(
        &mut self,
        properties: &[(&str, &str)],
    ) -> Result<(), FirstbootError> {
        self.ensure_loaded()?;
        let goal_state = self.get_goal_state(false).await?;
        let body = xml::role_properties(
            &goal_state.container.container_id,
            &goal_state.role_instance().instance_id,
            properties,
        );
        debug!("Role properties data: {}", body);
        self.wire_server_request("machine?comp=roleProperties", Some(body))
            .await?;
        Ok(())
    }

    /// Publish the thumbprint of the remote desktop certificate
    pub async fn post_rdp_cert_thumbprint(
        &mut self,
        thumbprint: &str,
    ) -> Result<(), FirstbootError> {
        self.post_role_properties(&[(ROLE_PROPERTY_CERT_THUMB, thumbprint)])
            .await
    }

    pub async fn get_hosting_environment(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        let url = self
            .get_goal_state(false)
            .await?
            .role_instance()
            .configuration
            .hosting_environment_config
            .clone();
        self.wire_server_text(&url).await
    }

    pub async fn get_shared_config(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        let url = self
            .get_goal_state(false)
            .await?
            .role_instance()
            .configuration
            .shared_config
            .clone();
        self.wire_server_text(&url).await
    }

    pub async fn get_extensions_config(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        let url = self
            .get_goal_state(false)
            .await?
            .role_instance()
            .configuration
            .extensions_config
            .clone()
            .ok_or_else(|| FirstbootError::NotFound("ExtensionsConfig".to_string()))?;
        self.wire_server_text(&url).await
    }

    pub async fn get_full_config(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        let url = self
            .get_goal_state(false)
            .await?
            .role_instance()
            .configuration
            .full_config
            .clone();
        self.wire_server_text(&url).await
    }
}

/// DHCP option 245 carries the address as four raw bytes
pub fn endpoint_from_option(value: &[u8]) -> Result<Ipv4Addr, FirstbootError> {
    let octets: [u8; 4] = value.try_into().map_err(|_| {
        FirstbootError::InvalidData(format!(
            "WireServer option has {} bytes, expected 4",
            value.len()
        ))
    })?;
    Ok(Ipv4Addr::from(octets))
}

/// Custom data is base64 encoded; anything else is returned as is
pub fn decode_custom_data(custom_data: &str) -> Vec<u8> {
    let compact: String = custom_data.split_whitespace().collect();
    BASE64
        .decode(compact.as_bytes())
        .unwrap_or_else(|_| custom_data.as_bytes().to_vec())
}

#[async_trait]
impl MetadataService for AzureService {
    fn name(&self) -> &'static str {
        "Azure"
    }

    async fn load(&mut self) -> bool {
        if self.http.base_url().is_none() {
            let endpoint = match self.discover_endpoint().await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    debug!("Azure WireServer endpoint not found: {}", e);
                    return false;
                }
            };
            info!("Azure WireServer endpoint: {}", endpoint);
            if let Err(e) = self.http.set_base_url(&format!("http://{endpoint}/")) {
                warn!("Invalid WireServer address {}: {}", endpoint, e);
                return false;
            }
        }

        match self.load_documents().await {
            Ok(()) => {
                self.loaded = true;
                true
            }
            Err(e) => {
                warn!("Failed to load Azure metadata: {}", e);
                false
            }
        }
    }

    async fn get_instance_id(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        Ok(self
            .get_goal_state(false)
            .await?
            .role_instance()
            .instance_id
            .clone())
    }

    async fn get_host_name(&mut self) -> Result<String, FirstbootError> {
        self.ensure_loaded()?;
        self.get_ovf_env()
            .await?
            .host_name()
            .map(str::to_string)
            .ok_or_else(|| FirstbootError::NotFound("ComputerName".to_string()))
    }

    async fn get_public_keys(&mut self) -> Result<Vec<String>, FirstbootError> {
        self.ensure_loaded()?;
        Ok(self.get_ovf_env().await?.ssh_public_keys())
    }

    async fn get_user_data(&mut self) -> Result<Vec<u8>, FirstbootError> {
        self.ensure_loaded()?;
        self.get_ovf_env()
            .await?
            .custom_data()
            .map(decode_custom_data)
            .ok_or_else(|| FirstbootError::NotFound("CustomData".to_string()))
    }

    async fn get_admin_password(&mut self) -> Result<Option<String>, FirstbootError> {
        self.ensure_loaded()?;
        Ok(self.get_ovf_env().await?.admin_password().map(str::to_string))
    }

    async fn provisioning_started(&mut self) -> Result<(), FirstbootError> {
        self.post_health_status(
            HEALTH_STATE_NOT_READY,
            Some(HealthDetails {
                sub_status: HEALTH_SUBSTATE_PROVISIONING,
                description: "firstboot-rs is preparing your computer for first use...",
            }),
        )
        .await
    }

    async fn provisioning_completed(&mut self) -> Result<(), FirstbootError> {
        self.post_health_status(HEALTH_STATE_READY, None).await
    }

    async fn provisioning_failed(&mut self) -> Result<(), FirstbootError> {
        self.post_health_status(
            HEALTH_STATE_NOT_READY,
            Some(HealthDetails {
                sub_status: HEALTH_SUBSTATE_PROVISIONING_FAILED,
                description: "Provisioning failed",
            }),
        )
        .await
    }
}
