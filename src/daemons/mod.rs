//! Clients for the playback daemons that run next to the hub
//!
//! These daemons cannot push state to us, so they are polled.

pub mod snapcast;
pub mod spotify;

use anyhow::Result;
use async_trait::async_trait;

/// A daemon whose state is read by polling
#[async_trait]
pub trait StatusPollCollaborator: Send + Sync {
    type Status: Send;

    async fn get_status(&self) -> Result<Self::Status>;
}
