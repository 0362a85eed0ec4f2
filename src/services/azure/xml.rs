//! WireServer and OVF environment documents
//!
//! Incoming documents are parsed into typed structs; element namespaces are
//! ignored, so `wa:ProvisioningSection` binds to `ProvisioningSection`.
//! Outgoing documents are small and written by hand.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::FirstbootError;

/// `?comp=Versions` response
#[derive(Debug, Clone, Deserialize)]
pub struct Versions {
    #[serde(rename = "Supported")]
    pub supported: VersionList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionList {
    #[serde(rename = "Version", default)]
    pub versions: Vec<String>,
}

impl Versions {
    pub fn supports(&self, version: &str) -> bool {
        self.supported.versions.iter().any(|v| v.trim() == version)
    }
}

/// `machine?comp=goalstate` response
#[derive(Debug, Clone, Deserialize)]
pub struct GoalState {
    #[serde(rename = "Incarnation")]
    pub incarnation: String,
    #[serde(rename = "Machine")]
    pub machine: Machine,
    #[serde(rename = "Container")]
    pub container: Container,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    #[serde(rename = "ExpectedState")]
    pub expected_state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Container {
    #[serde(rename = "ContainerId")]
    pub container_id: String,
    #[serde(rename = "RoleInstanceList")]
    pub role_instance_list: RoleInstanceList,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleInstanceList {
    #[serde(rename = "RoleInstance")]
    pub role_instance: RoleInstance,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleInstance {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "Configuration")]
    pub configuration: RoleConfiguration,
}

/// URLs of the configuration documents of a role instance
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfiguration {
    #[serde(rename = "HostingEnvironmentConfig")]
    pub hosting_environment_config: String,
    #[serde(rename = "SharedConfig")]
    pub shared_config: String,
    #[serde(rename = "ExtensionsConfig", default)]
    pub extensions_config: Option<String>,
    #[serde(rename = "FullConfig")]
    pub full_config: String,
}

impl GoalState {
    pub fn role_instance(&self) -> &RoleInstance {
        &self.container.role_instance_list.role_instance
    }
}

/// `ovf-env.xml` from the provisioning media
#[derive(Debug, Clone, Deserialize)]
pub struct OvfEnvironment {
    #[serde(rename = "ProvisioningSection")]
    pub provisioning_section: ProvisioningSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningSection {
    #[serde(rename = "WindowsProvisioningConfigurationSet", default)]
    pub windows: Option<WindowsProvisioningConfigurationSet>,
    #[serde(rename = "LinuxProvisioningConfigurationSet", default)]
    pub linux: Option<LinuxProvisioningConfigurationSet>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowsProvisioningConfigurationSet {
    #[serde(rename = "ComputerName")]
    pub computer_name: String,
    #[serde(rename = "AdminPassword", default)]
    pub admin_password: Option<String>,
    #[serde(rename = "CustomData", default)]
    pub custom_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinuxProvisioningConfigurationSet {
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "UserPassword", default)]
    pub user_password: Option<String>,
    #[serde(rename = "CustomData", default)]
    pub custom_data: Option<String>,
    #[serde(rename = "SSH", default)]
    pub ssh: Option<SshSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    #[serde(rename = "PublicKeys", default)]
    pub public_keys: Option<PublicKeyList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyList {
    #[serde(rename = "PublicKey", default)]
    pub keys: Vec<PublicKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicKey {
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
}

impl OvfEnvironment {
    pub fn host_name(&self) -> Option<&str> {
        let section = &self.provisioning_section;
        section
            .windows
            .as_ref()
            .map(|w| w.computer_name.as_str())
            .or_else(|| section.linux.as_ref().map(|l| l.host_name.as_str()))
    }

    pub fn admin_password(&self) -> Option<&str> {
        let section = &self.provisioning_section;
        section
            .windows
            .as_ref()
            .and_then(|w| w.admin_password.as_deref())
            .or_else(|| section.linux.as_ref().and_then(|l| l.user_password.as_deref()))
    }

    pub fn custom_data(&self) -> Option<&str> {
        let section = &self.provisioning_section;
        section
            .windows
            .as_ref()
            .and_then(|w| w.custom_data.as_deref())
            .or_else(|| section.linux.as_ref().and_then(|l| l.custom_data.as_deref()))
    }

    pub fn ssh_public_keys(&self) -> Vec<String> {
        self.provisioning_section
            .linux
            .as_ref()
            .and_then(|l| l.ssh.as_ref())
            .and_then(|s| s.public_keys.as_ref())
            .map(|list| {
                list.keys
                    .iter()
                    .filter_map(|k| k.value.as_deref())
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn parse<T: DeserializeOwned>(xml: &str) -> Result<T, FirstbootError> {
    Ok(serde_xml_rs::from_str(xml)?)
}

/// Escape text for element content and attribute values
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

/// Optional `Details` of a health report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthDetails<'a> {
    pub sub_status: &'a str,
    pub description: &'a str,
}

/// Body of a `machine?comp=health` POST
pub fn health_report(
    incarnation: &str,
    container_id: &str,
    instance_id: &str,
    state: &str,
    details: Option<HealthDetails<'_>>,
) -> String {
    let mut xml = String::from(XML_DECLARATION);
    xml.push_str(&format!(
        "<Health><GoalStateIncarnation>{}</GoalStateIncarnation>\
         <Container><ContainerId>{}</ContainerId>\
         <RoleInstanceList><Role><InstanceId>{}</InstanceId>\
         <Health><State>{}</State>",
        escape(incarnation),
        escape(container_id),
        escape(instance_id),
        escape(state),
    ));
    if let Some(details) = details {
        xml.push_str(&format!(
            "<Details><SubStatus>{}</SubStatus><Description>{}</Description></Details>",
            escape(details.sub_status),
            escape(details.description),
        ));
    }
    xml.push_str("</Health></Role></RoleInstanceList></Container></Health>");
    xml
}

/// Body of a `machine?comp=roleProperties` POST
pub fn role_properties(
    container_id: &str,
    instance_id: &str,
    properties: &[(&str, &str)],
) -> String {
    let mut xml = String::from(XML_DECLARATION);
    xml.push_str(&format!(
        "<RoleProperties><Container><ContainerId>{}</ContainerId>\
         <RoleInstances><RoleInstance><Id>{}</Id><Properties>",
        escape(container_id),
        escape(instance_id),
    ));
    for (name, value) in properties {
        xml.push_str(&format!(
            r#"<Property name="{}" value="{}" />"#,
            escape(name),
            escape(value)
        ));
    }
    xml.push_str("</Properties></RoleInstance></RoleInstances></Container></RoleProperties>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOAL_STATE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<GoalState xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <Version>2015-04-05</Version>
  <Incarnation>3</Incarnation>
  <Machine>
    <ExpectedState>Started</ExpectedState>
    <StopRolesDeadlineHint>300000</StopRolesDeadlineHint>
  </Machine>
  <Container>
    <ContainerId>c6d5b8a2-6b1e-4a32-9b4c-3a2f0d4e5f60</ContainerId>
    <RoleInstanceList>
      <RoleInstance>
        <InstanceId>b2d1a6e0.vm-1</InstanceId>
        <State>Started</State>
        <Configuration>
          <HostingEnvironmentConfig>http://168.63.129.16/machine/hosting</HostingEnvironmentConfig>
          <SharedConfig>http://168.63.129.16/machine/shared</SharedConfig>
          <ExtensionsConfig>http://168.63.129.16/machine/extensions</ExtensionsConfig>
          <FullConfig>http://168.63.129.16/machine/full</FullConfig>
          <ConfigName>b2d1a6e0.0.config.xml</ConfigName>
        </Configuration>
      </RoleInstance>
    </RoleInstanceList>
  </Container>
</GoalState>"#;

    #[test]
    fn test_parse_versions() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<Versions>
  <Preferred><Version>2015-04-05</Version></Preferred>
  <Supported>
    <Version>2015-04-05</Version>
    <Version>2012-11-30</Version>
  </Supported>
</Versions>"#;
        let versions: Versions = parse(xml).unwrap();
        assert!(versions.supports("2015-04-05"));
        assert!(versions.supports("2012-11-30"));
        assert!(!versions.supports("2010-12-15"));
    }

    #[test]
    fn test_parse_goal_state() {
        let goal_state: GoalState = parse(GOAL_STATE).unwrap();
        assert_eq!(goal_state.incarnation, "3");
        assert_eq!(goal_state.machine.expected_state, "Started");
        assert_eq!(
            goal_state.container.container_id,
            "c6d5b8a2-6b1e-4a32-9b4c-3a2f0d4e5f60"
        );
        let role = goal_state.role_instance();
        assert_eq!(role.instance_id, "b2d1a6e0.vm-1");
        assert_eq!(
            role.configuration.full_config,
            "http://168.63.129.16/machine/full"
        );
    }

    #[test]
    fn test_goal_state_missing_container_is_rejected() {
        let xml = "<GoalState><Incarnation>1</Incarnation>\
                   <Machine><ExpectedState>Started</ExpectedState></Machine></GoalState>";
        assert!(parse::<GoalState>(xml).is_err());
    }

    #[test]
    fn test_parse_ovf_env_windows() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1" xmlns:wa="http://schemas.microsoft.com/windowsazure">
  <wa:ProvisioningSection>
    <wa:Version>1.0</wa:Version>
    <WindowsProvisioningConfigurationSet xmlns="http://schemas.microsoft.com/windowsazure">
      <ConfigurationSetType>WindowsProvisioningConfiguration</ConfigurationSetType>
      <ComputerName>win-host</ComputerName>
      <AdminPassword>Passw0rd!</AdminPassword>
      <CustomData>aGVsbG8=</CustomData>
    </WindowsProvisioningConfigurationSet>
  </wa:ProvisioningSection>
</Environment>"#;
        let env: OvfEnvironment = parse(xml).unwrap();
        assert_eq!(env.host_name(), Some("win-host"));
        assert_eq!(env.admin_password(), Some("Passw0rd!"));
        assert_eq!(env.custom_data(), Some("aGVsbG8="));
        assert!(env.ssh_public_keys().is_empty());
    }

    #[test]
    fn test_parse_ovf_env_linux() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1" xmlns:wa="http://schemas.microsoft.com/windowsazure">
  <wa:ProvisioningSection>
    <wa:Version>1.0</wa:Version>
    <LinuxProvisioningConfigurationSet xmlns="http://schemas.microsoft.com/windowsazure">
      <ConfigurationSetType>LinuxProvisioningConfiguration</ConfigurationSetType>
      <HostName>linux-host</HostName>
      <UserName>azureuser</UserName>
      <SSH>
        <PublicKeys>
          <PublicKey>
            <Fingerprint>EB0C0AB4B2D5FC35F2F0658D19F44C8283E2DD62</Fingerprint>
            <Path>/home/azureuser/.ssh/authorized_keys</Path>
            <Value>ssh-rsa AAAA azureuser</Value>
          </PublicKey>
        </PublicKeys>
      </SSH>
    </LinuxProvisioningConfigurationSet>
  </wa:ProvisioningSection>
</Environment>"#;
        let env: OvfEnvironment = parse(xml).unwrap();
        assert_eq!(env.host_name(), Some("linux-host"));
        assert_eq!(env.admin_password(), None);
        assert_eq!(env.ssh_public_keys(), vec!["ssh-rsa AAAA azureuser"]);
    }

    #[test]
    fn test_health_report_with_details() {
        let xml = health_report(
            "3",
            "container",
            "role",
            "NotReady",
            Some(HealthDetails {
                sub_status: "Provisioning",
                description: "Preparing <vm> & disks",
            }),
        );
        assert!(xml.starts_with(XML_DECLARATION));
        assert!(xml.contains("<GoalStateIncarnation>3</GoalStateIncarnation>"));
        assert!(xml.contains("<State>NotReady</State>"));
        assert!(xml.contains("<SubStatus>Provisioning</SubStatus>"));
        assert!(xml.contains("<Description>Preparing &lt;vm&gt; &amp; disks</Description>"));
    }

    #[test]
    fn test_health_report_ready_has_no_details() {
        let xml = health_report("1", "c", "r", "Ready", None);
        assert!(xml.contains("<Health><State>Ready</State></Health>"));
        assert!(!xml.contains("Details"));
    }

    #[test]
    fn test_role_properties() {
        let xml = role_properties("c", "r", &[("CertificateThumbprint", "AB\"CD")]);
        assert!(xml.contains("<Id>r</Id>"));
        assert!(xml.contains(r#"<Property name="CertificateThumbprint" value="AB&quot;CD" />"#));
    }

    #[test]
    fn test_role_properties_full_body() {
        let xml = role_properties("c", "r", &[("a", "1"), ("b", "2")]);
        assert_eq!(
            xml,
            format!(
                "{XML_DECLARATION}<RoleProperties><Container><ContainerId>c</ContainerId>\
                 <RoleInstances><RoleInstance><Id>r</Id><Properties>\
                 <Property name=\"a\" value=\"1\" /><Property name=\"b\" value=\"2\" />\
                 </Properties></RoleInstance></RoleInstances></Container></RoleProperties>"
            )
        );
    }
}
