//! Fan-out of committed source changes to dependent services
//!
//! The arbiter awaits [`SourceChangeNotifier::notify`] after every committed
//! transition. Handlers run in registration order; a failing handler is
//! logged and skipped.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::{BroadcastHub, Envelope, Topic};

/// A subsystem that reacts to the active source changing
#[async_trait]
pub trait SourceChangeHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn on_source_changed(&self, old: Option<&str>, new: Option<&str>) -> Result<()>;
}

/// Ordered list of handlers
#[derive(Default)]
pub struct SourceChangeNotifier {
    handlers: Vec<Arc<dyn SourceChangeHandler>>,
}

impl SourceChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn SourceChangeHandler>) {
        debug!("Registered source change handler: {}", handler.name());
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invoke every handler in order. Returns the number that succeeded.
    pub async fn notify(&self, old: Option<&str>, new: Option<&str>) -> usize {
        let mut ok = 0;
        for handler in &self.handlers {
            match handler.on_source_changed(old, new).await {
                Ok(()) => ok += 1,
                Err(e) => warn!(
                    "Source change handler {} failed ({:?} -> {:?}): {:#}",
                    handler.name(),
                    old,
                    new,
                    e
                ),
            }
        }
        ok
    }
}

// =============================================================================
// SourceStatusPanel
// =============================================================================

/// Tells each source's own panel whether it just gained or lost the output
pub struct SourceStatusPanel {
    hub: Arc<BroadcastHub>,
}

impl SourceStatusPanel {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl SourceChangeHandler for SourceStatusPanel {
    fn name(&self) -> &str {
        "source-status"
    }

    async fn on_source_changed(&self, old: Option<&str>, new: Option<&str>) -> Result<()> {
        if let Some(old) = old {
            self.hub.publish(
                &Topic::new(old),
                Envelope::new("source_status", json!({ "source": old, "active": false })),
            );
        }
        if let Some(new) = new {
            self.hub.publish(
                &Topic::new(new),
                Envelope::new("source_status", json!({ "source": new, "active": true })),
            );
        }
        Ok(())
    }
}
