//! Give a service its own account with a freshly generated password

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Plugin, PluginOutcome, SharedData};
use crate::FirstbootError;
use crate::osutils::OsUtils;
use crate::services::MetadataService;

/// Key under which the configured account name is shared with later plugins
pub const SERVICE_USER_KEY: &str = "service_user";

pub struct SetServiceUserPlugin {
    username: Option<String>,
    service_name: Option<String>,
    os: Arc<dyn OsUtils>,
}

impl SetServiceUserPlugin {
    pub fn new(
        username: Option<String>,
        service_name: Option<String>,
        os: Arc<dyn OsUtils>,
    ) -> Self {
        Self {
            username,
            service_name,
            os,
        }
    }
}

#[async_trait]
impl Plugin for SetServiceUserPlugin {
    fn name(&self) -> &'static str {
        "setserviceuser"
    }

    async fn execute(
        &self,
        _service: &mut dyn MetadataService,
        shared: &mut SharedData,
    ) -> Result<PluginOutcome, FirstbootError> {
        let (Some(username), Some(service_name)) = (&self.username, &self.service_name) else {
            debug!("service_username or service_name not set, skipping");
            return Ok(PluginOutcome::done());
        };

        debug!("Generating a random user password");
        let password = self
            .os
            .generate_random_password(self.os.get_maximum_password_length());
        self.os.set_user_password(username, &password).await?;

        if self.os.check_service_exists(service_name).await? {
            debug!("Setting service {} to run as {}", service_name, username);
            self.os
                .set_service_credentials(service_name, username, &password)
                .await?;
        } else {
            debug!("Service {} does not exist", service_name);
        }

        shared.insert(
            SERVICE_USER_KEY.to_string(),
            serde_json::Value::String(username.clone()),
        );
        Ok(PluginOutcome::done())
    }
}
