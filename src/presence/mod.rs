//! Device presence tracking for the Bluetooth input
//!
//! Connect/disconnect notifications arrive from the presence collaborator out
//! of order and sometimes twice. Every mutation here is idempotent.
//!
//! Policy: one courteous device. The first device to connect becomes active;
//! any other device that connects while one is active is disconnected right
//! away. `pending_device` is therefore always empty, and is kept in the
//! published status so clients see a stable shape.

pub mod bluetoothctl;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::arbiter::SourceArbiter;
use crate::bus::{BroadcastHub, Envelope, Topic};
use crate::error::{bounded, HubError, HubResult};

/// Default budget for one collaborator call
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix of BlueZ device object paths
const DEVICE_PATH_PREFIX: &str = "/org/bluez/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub address: String,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
}

impl DeviceInfo {
    pub fn new(address: &str, display_name: impl Into<String>) -> Self {
        Self {
            address: normalize_address(address),
            display_name: display_name.into(),
            connected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DevicePresenceState {
    pub active_device: Option<DeviceInfo>,
    pub pending_device: Option<DeviceInfo>,
}

impl DevicePresenceState {
    /// Active and pending must never name the same device
    pub fn check_invariant(&self) -> HubResult<()> {
        match (&self.active_device, &self.pending_device) {
            (Some(active), Some(pending)) if active.address == pending.address => {
                Err(HubError::InternalInvariant(format!(
                    "device {} is both active and pending",
                    active.address
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Presence change reported by the collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Connected(DeviceInfo),
    /// Address or device object path
    Disconnected(String),
}

/// Narrow contract over the platform's device daemon
#[async_trait]
pub trait PresenceCollaborator: Send + Sync {
    /// Authoritative list of currently connected devices
    async fn list_connected(&self) -> Result<Vec<DeviceInfo>>;

    async fn disconnect(&self, address: &str) -> Result<()>;
}

/// Accepts `AA:BB:CC:DD:EE:FF`, lowercase variants, and device object paths
/// such as `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
pub fn normalize_address(address_or_path: &str) -> String {
    let raw = address_or_path.trim();
    let address = if raw.starts_with(DEVICE_PATH_PREFIX) {
        raw.rsplit('/')
            .next()
            .and_then(|leaf| leaf.strip_prefix("dev_"))
            .map(|leaf| leaf.replace('_', ":"))
            .unwrap_or_else(|| raw.to_string())
    } else {
        raw.to_string()
    };
    address.to_ascii_uppercase()
}

/// Result of a connect notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Device became the active device
    Adopted,
    /// Same device was already active
    AlreadyActive,
    /// Another device is active; this one was turned away
    Rejected,
}

// =============================================================================
// PresenceTracker
// =============================================================================

pub struct PresenceTracker {
    source_id: String,
    state: Mutex<DevicePresenceState>,
    collaborator: Arc<dyn PresenceCollaborator>,
    arbiter: Arc<SourceArbiter>,
    hub: Arc<BroadcastHub>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(
        source_id: impl Into<String>,
        collaborator: Arc<dyn PresenceCollaborator>,
        arbiter: Arc<SourceArbiter>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            state: Mutex::new(DevicePresenceState::default()),
            collaborator,
            arbiter,
            hub,
            timeout: DEFAULT_PRESENCE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> DevicePresenceState {
        self.state.lock().clone()
    }

    pub async fn on_device_connected(&self, device: DeviceInfo) -> ConnectOutcome {
        let device = DeviceInfo {
            address: normalize_address(&device.address),
            ..device
        };

        let outcome = {
            let mut state = self.state.lock();
            match &state.active_device {
                None => {
                    state.active_device = Some(device.clone());
                    ConnectOutcome::Adopted
                }
                Some(active) if active.address == device.address => ConnectOutcome::AlreadyActive,
                Some(_) => ConnectOutcome::Rejected,
            }
        };

        match outcome {
            ConnectOutcome::Adopted => {
                info!(
                    "Device {} ({}) is now active",
                    device.display_name, device.address
                );
                self.publish_status();
                if !self.arbiter.is_current(&self.source_id) {
                    self.request_switch().await;
                }
            }
            ConnectOutcome::AlreadyActive => {
                debug!("Device {} already active", device.address);
                self.publish_status();
            }
            ConnectOutcome::Rejected => {
                info!(
                    "Rejecting {} ({}): another device is active",
                    device.display_name, device.address
                );
                self.disconnect_quietly(&device.address).await;
            }
        }
        outcome
    }

    /// Clear the matching slot. Returns false when nothing matched.
    pub async fn on_device_disconnected(&self, address_or_path: &str) -> bool {
        let address = normalize_address(address_or_path);

        let cleared = {
            let mut state = self.state.lock();
            let matches = state
                .active_device
                .as_ref()
                .is_some_and(|d| d.address == address);
            if matches {
                state.active_device = None;
            }
            matches
        };

        if !cleared {
            debug!("Disconnect for unknown device {}, ignoring", address);
            return false;
        }

        info!("Device {} disconnected", address);
        self.publish_status();
        self.request_release().await;
        true
    }

    /// User-requested disconnect
    pub async fn disconnect_device(&self, address_or_path: &str) -> HubResult<()> {
        let address = normalize_address(address_or_path);
        let op = format!("disconnect {}", address);
        bounded(&op, self.timeout, self.collaborator.disconnect(&address)).await?;
        self.on_device_disconnected(&address).await;
        Ok(())
    }

    /// Rebuild presence state from the collaborator's connected list.
    ///
    /// An unavailable collaborator counts as "nothing connected".
    pub async fn reconcile(&self) -> DevicePresenceState {
        let devices = match bounded(
            "list connected devices",
            self.timeout,
            self.collaborator.list_connected(),
        )
        .await
        {
            Ok(devices) => devices,
            Err(e) => {
                warn!("{}, treating as no devices connected", e);
                Vec::new()
            }
        };

        let (previous, snapshot, extras) = {
            let mut state = self.state.lock();
            if let Err(e) = state.check_invariant() {
                error!("{}, rebuilding presence from the daemon", e);
            }
            let previous = state.active_device.clone();

            // Prefer keeping the device we already had
            let kept = previous.as_ref().and_then(|active| {
                devices
                    .iter()
                    .find(|d| normalize_address(&d.address) == active.address)
                    .map(|_| active.clone())
            });
            let active = kept.or_else(|| {
                devices.first().map(|d| DeviceInfo {
                    address: normalize_address(&d.address),
                    ..d.clone()
                })
            });

            let extras: Vec<String> = devices
                .iter()
                .map(|d| normalize_address(&d.address))
                .filter(|addr| active.as_ref().map(|a| &a.address) != Some(addr))
                .collect();

            // A second device is never held back, so nothing is pending
            state.active_device = active;
            state.pending_device = None;
            (previous, state.clone(), extras)
        };

        for address in &extras {
            info!("Reconcile: disconnecting extra device {}", address);
            self.disconnect_quietly(address).await;
        }

        self.publish_status();

        let previous_address = previous.as_ref().map(|d| d.address.as_str());
        let current_address = snapshot.active_device.as_ref().map(|d| d.address.as_str());
        match (previous_address, current_address) {
            (Some(_), None) => self.request_release().await,
            (None, Some(_)) => {
                if !self.arbiter.is_current(&self.source_id) {
                    self.request_switch().await;
                }
            }
            _ => {}
        }

        snapshot
    }

    /// Publish the current state without touching it
    pub fn publish_status(&self) {
        let state = self.state();
        self.hub.publish(
            &Topic::new(self.source_id.as_str()),
            Envelope::new(
                "devices_status",
                json!({
                    "active_device": state.active_device,
                    "pending_device": state.pending_device,
                }),
            ),
        );
    }

    /// Apply presence events until cancelled or the sender goes away
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PresenceEvent>,
        cancel: CancellationToken,
    ) {
        info!("Presence tracker for {} started", self.source_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some(PresenceEvent::Connected(device)) => {
                            self.on_device_connected(device).await;
                        }
                        Some(PresenceEvent::Disconnected(address)) => {
                            self.on_device_disconnected(&address).await;
                        }
                        None => {
                            debug!("Presence event channel closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("Presence tracker for {} stopped", self.source_id);
    }

    async fn request_switch(&self) {
        match self.arbiter.switch_to(&self.source_id).await {
            Ok(true) => {}
            Ok(false) => warn!(
                "Could not activate {}: another switch is in progress",
                self.source_id
            ),
            Err(e) => warn!("Could not activate {}: {}", self.source_id, e),
        }
    }

    async fn request_release(&self) {
        match self.arbiter.release(&self.source_id).await {
            Ok(true) => {}
            Ok(false) => warn!(
                "Could not release {}: another switch is in progress",
                self.source_id
            ),
            Err(e) => warn!("Could not release {}: {}", self.source_id, e),
        }
    }

    async fn disconnect_quietly(&self, address: &str) {
        let op = format!("disconnect {}", address);
        if let Err(e) = bounded(&op, self.timeout, self.collaborator.disconnect(address)).await {
            warn!("{}", e);
        }
    }
}
