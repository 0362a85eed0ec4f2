//! Integration tests for the Azure WireServer service using wiremock

use std::sync::Arc;

use firstboot_rs::FirstbootError;
use firstboot_rs::config::Config;
use firstboot_rs::retry::Retry;
use firstboot_rs::services::MetadataService;
use firstboot_rs::services::azure::{AzureService, OVF_ENV_DRIVE_TAG, OVF_ENV_FILENAME};
use firstboot_rs::testing::{MockOsUtils, StaticDhcpSource};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VERSIONS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Versions>
  <Preferred><Version>2015-04-05</Version></Preferred>
  <Supported>
    <Version>2015-04-05</Version>
    <Version>2012-11-30</Version>
  </Supported>
</Versions>"#;

const OVF_ENV: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1" xmlns:wa="http://schemas.microsoft.com/windowsazure">
  <wa:ProvisioningSection>
    <wa:Version>1.0</wa:Version>
    <LinuxProvisioningConfigurationSet xmlns="http://schemas.microsoft.com/windowsazure">
      <ConfigurationSetType>LinuxProvisioningConfiguration</ConfigurationSetType>
      <HostName>azure-vm</HostName>
      <UserName>azureuser</UserName>
      <UserPassword>S3cret!</UserPassword>
      <CustomData>I2Nsb3VkLWNvbmZpZwo=</CustomData>
      <SSH>
        <PublicKeys>
          <PublicKey>
            <Fingerprint>EB0C0AB4B2D5FC35F2F0658D19F44C8283E2DD62</Fingerprint>
            <Path>/home/azureuser/.ssh/authorized_keys</Path>
            <Value>ssh-rsa AAAAazure azureuser</Value>
          </PublicKey>
        </PublicKeys>
      </SSH>
    </LinuxProvisioningConfigurationSet>
  </wa:ProvisioningSection>
</Environment>"#;

fn goal_state(base: &str, expected_state: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<GoalState>
  <Version>2015-04-05</Version>
  <Incarnation>7</Incarnation>
  <Machine><ExpectedState>{expected_state}</ExpectedState></Machine>
  <Container>
    <ContainerId>0f1e2d3c-container</ContainerId>
    <RoleInstanceList>
      <RoleInstance>
        <InstanceId>role-instance-1</InstanceId>
        <State>Started</State>
        <Configuration>
          <HostingEnvironmentConfig>{base}/machine/hosting</HostingEnvironmentConfig>
          <SharedConfig>{base}/machine/shared</SharedConfig>
          <FullConfig>{base}/machine/full</FullConfig>
        </Configuration>
      </RoleInstance>
    </RoleInstanceList>
  </Container>
</GoalState>"#
    )
}

async fn wire_server(expected_state: &str) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("comp", "Versions"))
        .and(header("x-ms-guest-agent-name", "firstboot-rs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(VERSIONS))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/machine"))
        .and(query_param("comp", "goalstate"))
        .and(header("x-ms-version", "2015-04-05"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(goal_state(&server.uri(), expected_state)),
        )
        .mount(&server)
        .await;

    server
}

/// A provisioning drive holding the tag file and `ovf-env.xml`
fn ovf_drive() -> TempDir {
    let drive = TempDir::new().unwrap();
    std::fs::write(drive.path().join(OVF_ENV_DRIVE_TAG), "").unwrap();
    std::fs::write(drive.path().join(OVF_ENV_FILENAME), OVF_ENV).unwrap();
    drive
}

fn service(server: &MockServer, os: MockOsUtils) -> AzureService {
    AzureService::new(
        &Config::default(),
        Arc::new(os),
        Arc::new(StaticDhcpSource::new()),
    )
    .unwrap()
    .with_retries(Retry::disabled(), Retry::disabled())
    .with_base_url(&server.uri())
    .unwrap()
}

#[tokio::test]
async fn test_azure_load_and_accessors() {
    let server = wire_server("Started").await;
    let empty = TempDir::new().unwrap();
    let drive = ovf_drive();
    let os = MockOsUtils::new()
        .with_logical_drive(empty.path())
        .with_logical_drive(drive.path());
    let mut azure = service(&server, os);

    assert!(matches!(
        azure.get_instance_id().await,
        Err(FirstbootError::NotLoaded("Azure"))
    ));

    assert!(azure.load().await);
    assert_eq!(azure.get_instance_id().await.unwrap(), "role-instance-1");
    assert_eq!(azure.get_host_name().await.unwrap(), "azure-vm");
    assert_eq!(
        azure.get_admin_password().await.unwrap().as_deref(),
        Some("S3cret!")
    );
    assert_eq!(azure.get_user_data().await.unwrap(), b"#cloud-config\n");
    assert_eq!(
        azure.get_public_keys().await.unwrap(),
        vec!["ssh-rsa AAAAazure azureuser".to_string()]
    );
}

#[tokio::test]
async fn test_azure_goal_state_not_started_fails_load() {
    let server = wire_server("Stopped").await;
    let drive = ovf_drive();
    let mut azure = service(&server, MockOsUtils::new().with_logical_drive(drive.path()));

    assert!(!azure.load().await);
}

#[tokio::test]
async fn test_azure_unsupported_version_fails_load() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("comp", "Versions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<Versions><Supported><Version>2010-12-15</Version></Supported></Versions>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("comp", "goalstate"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let drive = ovf_drive();
    let mut azure = service(&server, MockOsUtils::new().with_logical_drive(drive.path()));
    assert!(!azure.load().await);
}

#[tokio::test]
async fn test_azure_missing_ovf_drive_fails_load() {
    let server = wire_server("Started").await;
    let empty = TempDir::new().unwrap();
    let mut azure = service(&server, MockOsUtils::new().with_logical_drive(empty.path()));

    assert!(!azure.load().await);
}

#[tokio::test]
async fn test_azure_tagged_drive_without_ovf_env_fails_load() {
    let server = wire_server("Started").await;
    let drive = TempDir::new().unwrap();
    std::fs::write(drive.path().join(OVF_ENV_DRIVE_TAG), "").unwrap();
    let mut azure = service(&server, MockOsUtils::new().with_logical_drive(drive.path()));

    assert!(!azure.load().await);
}

#[tokio::test]
async fn test_azure_health_reports() {
    let server = wire_server("Started").await;

    Mock::given(method("POST"))
        .and(path("/machine"))
        .and(query_param("comp", "health"))
        .and(header("x-ms-version", "2015-04-05"))
        .and(header("x-ms-guest-agent-name", "firstboot-rs"))
        .and(header("Content-Type", "text/xml; charset=utf-8"))
        .and(body_string_contains("<State>NotReady</State>"))
        .and(body_string_contains("<SubStatus>Provisioning</SubStatus>"))
        .and(body_string_contains("<InstanceId>role-instance-1</InstanceId>"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/machine"))
        .and(query_param("comp", "health"))
        .and(body_string_contains("<State>Ready</State>"))
        .and(body_string_contains(
            "<GoalStateIncarnation>7</GoalStateIncarnation>",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let drive = ovf_drive();
    let mut azure = service(&server, MockOsUtils::new().with_logical_drive(drive.path()));
    assert!(azure.load().await);

    azure.provisioning_started().await.unwrap();
    azure.provisioning_completed().await.unwrap();
}

#[tokio::test]
async fn test_azure_provisioning_failed_report() {
    let server = wire_server("Started").await;
    Mock::given(method("POST"))
        .and(path("/machine"))
        .and(query_param("comp", "health"))
        .and(body_string_contains(
            "<SubStatus>ProvisioningFailed</SubStatus>",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let drive = ovf_drive();
    let mut azure = service(&server, MockOsUtils::new().with_logical_drive(drive.path()));
    assert!(azure.load().await);
    azure.provisioning_failed().await.unwrap();
}

#[tokio::test]
async fn test_azure_role_properties_and_configs() {
    let server = wire_server("Started").await;
    Mock::given(method("POST"))
        .and(path("/machine"))
        .and(query_param("comp", "roleProperties"))
        .and(body_string_contains(
            r#"<Property name="CertificateThumbprint" value="ABCDEF0123" />"#,
        ))
        .and(body_string_contains("<ContainerId>0f1e2d3c-container</ContainerId>"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/machine/full"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<FullConfig/>"))
        .mount(&server)
        .await;

    let drive = ovf_drive();
    let mut azure = service(&server, MockOsUtils::new().with_logical_drive(drive.path()));
    assert!(azure.load().await);

    azure.post_rdp_cert_thumbprint("ABCDEF0123").await.unwrap();
    assert_eq!(azure.get_full_config().await.unwrap(), "<FullConfig/>");
    assert!(azure.get_extensions_config().await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_azure_health_before_load_is_not_loaded() {
    let server = wire_server("Started").await;
    let mut azure = service(&server, MockOsUtils::new());

    assert!(matches!(
        azure.provisioning_started().await,
        Err(FirstbootError::NotLoaded("Azure"))
    ));
}
