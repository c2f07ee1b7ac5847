//! Builder for creating a call engine

use std::sync::Arc;

use tracing::info;

use super::{CallEngine, SoftphoneConfig};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::CallEventHandler;
use crate::sdk::SdkRef;

/// Builder for creating a [`CallEngine`]
pub struct SoftphoneBuilder {
    config: SoftphoneConfig,
    sdk: Option<SdkRef>,
    handler: Option<Arc<dyn CallEventHandler>>,
    attach_events: bool,
}

impl SoftphoneBuilder {
    pub fn new() -> Self {
        Self {
            config: SoftphoneConfig::default(),
            sdk: None,
            handler: None,
            attach_events: true,
        }
    }

    pub fn config(mut self, config: SoftphoneConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the vendor SDK handle
    pub fn sdk(mut self, sdk: SdkRef) -> Self {
        self.sdk = Some(sdk);
        self
    }

    /// Set the host UI handler
    pub fn handler(mut self, handler: Arc<dyn CallEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Whether to subscribe to SDK events on build (default true)
    pub fn attach_events(mut self, attach: bool) -> Self {
        self.attach_events = attach;
        self
    }

    /// Build the engine
    pub async fn build(self) -> SoftphoneResult<Arc<CallEngine>> {
        if !self.config.enabled {
            return Err(SoftphoneError::Disabled);
        }
        let sdk = self.sdk.ok_or_else(|| SoftphoneError::MissingConfiguration {
            field: "sdk".to_string(),
        })?;

        let engine = CallEngine::new(self.config, sdk)?;
        if let Some(handler) = self.handler {
            engine.set_event_handler(handler);
        }
        if self.attach_events {
            let subscription = engine.attach_sdk_events();
            info!(
                surfaces = ?subscription.surfaces,
                listeners = subscription.listeners,
                "Softphone ready"
            );
        }
        Ok(engine)
    }
}

impl Default for SoftphoneBuilder {
    fn default() -> Self {
        Self::new()
    }
}
