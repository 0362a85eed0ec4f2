//! Runs the service's finalize action once provisioning is complete

use async_trait::async_trait;
use tracing::debug;

use super::{Plugin, PluginOutcome, SharedData, Stage};
use crate::FirstbootError;
use crate::services::MetadataService;

pub struct FinalizePlugin;

#[async_trait]
impl Plugin for FinalizePlugin {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn stage(&self) -> Stage {
        Stage::Finalize
    }

    async fn execute(
        &self,
        service: &mut dyn MetadataService,
        _shared: &mut SharedData,
    ) -> Result<PluginOutcome, FirstbootError> {
        if service.supports_finalize() {
            service.on_finalize().await?;
        } else {
            debug!("Service {} does not implement a finalize action", service.name());
        }
        Ok(PluginOutcome::done())
    }
}
