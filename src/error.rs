//! Error taxonomy shared by the arbiter, presence tracker and broadcast hub.
//!
//! Collaborators (scripts, daemons, mixers) report failures as `anyhow::Error`.
//! Those are converted into [`HubError`] at the component boundary by [`bounded`],
//! which also enforces the per-call timeout.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub type HubResult<T> = std::result::Result<T, HubError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// External script/daemon call failed. Never retried automatically.
    #[error("{operation} failed: {message}")]
    TransientIo { operation: String, message: String },

    /// External call exceeded its time budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Another source switch is in flight.
    #[error("a source switch is already in progress, try again")]
    Conflict,

    #[error("unknown {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("reconnect budget exhausted for topic {topic} after {attempts} attempts")]
    ReconnectExhausted { topic: String, attempts: u32 },
}

impl HubError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::TransientIo {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// TransientIO class: the caller may re-invoke the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::Timeout { .. })
    }
}

/// Run a collaborator call with a hard time limit, mapping its error into the taxonomy.
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> HubResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(HubError::transient(operation, format!("{:#}", e))),
        Err(_) => Err(HubError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}
