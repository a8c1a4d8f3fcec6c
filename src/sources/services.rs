//! System services that can be switched on and off independently of sources

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{HubError, HubResult};

/// A service with an enabled/disabled state (e.g. software volume control)
#[async_trait]
pub trait ToggleableService: Send + Sync {
    fn id(&self) -> &str;

    async fn enable(&self) -> Result<()>;

    async fn disable(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;
}

/// Insertion-ordered registry of toggleable services
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<dyn ToggleableService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn ToggleableService>) -> HubResult<()> {
        let id = service.id().to_string();
        if self.get(&id).is_some() {
            warn!("Service {} already registered, ignoring duplicate", id);
            return Err(HubError::InternalInvariant(format!(
                "service {} registered twice",
                id
            )));
        }
        info!("Registered service: {}", id);
        self.services.push(service);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ToggleableService>> {
        self.services.iter().find(|s| s.id() == id).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ToggleableService>> {
        self.services.iter()
    }

    /// Enable or disable a service by id
    pub async fn toggle(&self, id: &str, enable: bool) -> HubResult<()> {
        let service = self
            .get(id)
            .ok_or_else(|| HubError::not_found("service", id))?;
        let result = if enable {
            service.enable().await
        } else {
            service.disable().await
        };
        result.map_err(|e| {
            let action = if enable { "enable" } else { "disable" };
            HubError::transient(format!("{} {}", action, id), format!("{:#}", e))
        })?;
        info!("Service {} {}", id, if enable { "enabled" } else { "disabled" });
        Ok(())
    }
}
