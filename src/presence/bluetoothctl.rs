//! Presence collaborator backed by the `bluetoothctl` CLI

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::bounded;

use super::{normalize_address, DeviceInfo, PresenceCollaborator, PresenceEvent};

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

pub struct BluetoothctlPresence {
    program: String,
}

impl Default for BluetoothctlPresence {
    fn default() -> Self {
        Self::new("bluetoothctl")
    }
}

impl BluetoothctlPresence {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {} {}", self.program, args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl PresenceCollaborator for BluetoothctlPresence {
    async fn list_connected(&self) -> Result<Vec<DeviceInfo>> {
        let stdout = self.run(&["devices", "Connected"]).await?;
        Ok(parse_devices(&stdout))
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        self.run(&["disconnect", &address]).await?;
        info!("Disconnected {}", address);
        Ok(())
    }
}

/// Parse `Device <ADDR> <NAME>` lines, skipping anything else
pub fn parse_devices(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Device ")?;
            let (address, name) = match rest.split_once(' ') {
                Some((address, name)) => (address, name.trim()),
                None => (rest, ""),
            };
            if address.len() != 17 || address.matches(':').count() != 5 {
                return None;
            }
            let name = if name.is_empty() { address } else { name };
            Some(DeviceInfo::new(address, name))
        })
        .collect()
}

/// Compare two connected lists, yielding events in a stable order
pub fn diff_devices(previous: &[DeviceInfo], current: &[DeviceInfo]) -> Vec<PresenceEvent> {
    let before: HashMap<&str, &DeviceInfo> =
        previous.iter().map(|d| (d.address.as_str(), d)).collect();
    let after: HashMap<&str, &DeviceInfo> =
        current.iter().map(|d| (d.address.as_str(), d)).collect();

    let mut events: Vec<PresenceEvent> = previous
        .iter()
        .filter(|d| !after.contains_key(d.address.as_str()))
        .map(|d| PresenceEvent::Disconnected(d.address.clone()))
        .collect();
    events.extend(
        current
            .iter()
            .filter(|d| !before.contains_key(d.address.as_str()))
            .map(|d| PresenceEvent::Connected(d.clone())),
    );
    events
}

/// Poll the collaborator and emit connect/disconnect events on changes.
///
/// The first successful poll is the baseline; the tracker's own reconcile
/// covers devices already connected at startup. Each poll is limited to
/// `timeout` and abandoned as soon as `cancel` fires.
pub async fn watch(
    collaborator: Arc<dyn PresenceCollaborator>,
    events: mpsc::Sender<PresenceEvent>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut known: Option<Vec<DeviceInfo>> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'watch: loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tokio::select! {
                _ = cancel.cancelled() => break,
                polled = bounded("list connected devices", timeout, collaborator.list_connected()) => polled,
            },
        };
        let current = match polled {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Presence poll failed: {}", e);
                continue;
            }
        };

        let Some(previous) = known.replace(current.clone()) else {
            debug!("Presence baseline: {} device(s)", current.len());
            continue;
        };

        for event in diff_devices(&previous, &current) {
            tokio::select! {
                _ = cancel.cancelled() => break 'watch,
                sent = events.send(event) => {
                    if sent.is_err() {
                        debug!("Presence tracker gone, stopping watcher");
                        return;
                    }
                }
            }
        }
    }
    debug!("Presence watcher stopped");
}
