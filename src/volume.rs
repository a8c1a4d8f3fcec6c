//! Output level control
//!
//! Clients work on a 0-100 display scale. The amplifier only sounds right in a
//! narrower hardware window, so display values are mapped linearly onto
//! `[min, max]` of the mixer control.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::bus::{BroadcastHub, Envelope, Topic};
use crate::error::{bounded, HubResult};
use crate::notifier::SourceChangeHandler;
use crate::sources::services::ToggleableService;

pub const VOLUME_TOPIC: &str = "volume";

const DISPLAY_MAX: i32 = 100;
const MIXER_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// VolumeCurve
// =============================================================================

/// Linear map between display 0..=100 and hardware `min..=max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeCurve {
    pub min: i32,
    pub max: i32,
}

impl Default for VolumeCurve {
    fn default() -> Self {
        Self { min: 40, max: 98 }
    }
}

impl VolumeCurve {
    pub fn new(min: i32, max: i32) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    fn span(&self) -> f64 {
        (self.max - self.min) as f64
    }

    pub fn clamp_hardware(&self, hardware: i32) -> i32 {
        hardware.clamp(self.min, self.max)
    }

    pub fn to_hardware(&self, display: i32) -> i32 {
        let display = display.clamp(0, DISPLAY_MAX);
        (display as f64 / DISPLAY_MAX as f64 * self.span()).round() as i32 + self.min
    }

    pub fn to_display(&self, hardware: i32) -> i32 {
        if self.max == self.min {
            return 0;
        }
        let normalized = (self.clamp_hardware(hardware) - self.min) as f64;
        (normalized / self.span() * DISPLAY_MAX as f64).round() as i32
    }
}

// =============================================================================
// Mixers
// =============================================================================

/// Hardware level control, in mixer percent
#[async_trait]
pub trait Mixer: Send + Sync {
    async fn get(&self) -> Result<i32>;

    async fn set(&self, level: i32) -> Result<()>;
}

/// In-memory mixer for machines without the amplifier
pub struct SoftMixer {
    level: AtomicI32,
}

impl SoftMixer {
    pub fn new(level: i32) -> Self {
        Self {
            level: AtomicI32::new(level),
        }
    }
}

#[async_trait]
impl Mixer for SoftMixer {
    async fn get(&self) -> Result<i32> {
        Ok(self.level.load(Ordering::SeqCst))
    }

    async fn set(&self, level: i32) -> Result<()> {
        self.level.store(level, Ordering::SeqCst);
        Ok(())
    }
}

/// ALSA mixer control driven through `amixer`
pub struct AmixerMixer {
    control: String,
}

impl AmixerMixer {
    pub fn new(control: impl Into<String>) -> Self {
        Self {
            control: control.into(),
        }
    }

    async fn amixer(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("amixer")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to run amixer")?;
        if !output.status.success() {
            bail!(
                "amixer {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Mixer for AmixerMixer {
    async fn get(&self) -> Result<i32> {
        let stdout = self.amixer(&["sget", &self.control]).await?;
        parse_amixer_percent(&stdout)
            .ok_or_else(|| anyhow!("no level found for control {}", self.control))
    }

    async fn set(&self, level: i32) -> Result<()> {
        self.amixer(&["sset", &self.control, &format!("{}%", level)])
            .await?;
        Ok(())
    }
}

/// Average of every `[NN%]` channel level in `amixer sget` output
pub fn parse_amixer_percent(output: &str) -> Option<i32> {
    let levels: Vec<i32> = output
        .lines()
        .filter_map(|line| {
            let start = line.find('[')?;
            let rest = &line[start + 1..];
            let end = rest.find("%]")?;
            rest[..end].trim().parse::<i32>().ok()
        })
        .collect();
    if levels.is_empty() {
        return None;
    }
    Some(levels.iter().sum::<i32>() / levels.len() as i32)
}

// =============================================================================
// VolumeService
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeStatus {
    pub volume: i32,
    pub hardware_volume: i32,
    pub show_volume_bar: bool,
    pub is_initial_status: bool,
}

pub struct VolumeService {
    curve: VolumeCurve,
    step: i32,
    ramp_steps: u32,
    ramp_interval: Duration,
    mixer: Arc<dyn Mixer>,
    hub: Arc<BroadcastHub>,
    enabled: AtomicBool,
    /// Held for the full duration of a ramp or a direct set
    ramp: tokio::sync::Mutex<()>,
}

impl VolumeService {
    pub fn new(curve: VolumeCurve, mixer: Arc<dyn Mixer>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            curve,
            step: 5,
            ramp_steps: 3,
            ramp_interval: Duration::from_millis(50),
            mixer,
            hub,
            enabled: AtomicBool::new(true),
            ramp: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_step(mut self, step: i32) -> Self {
        self.step = step;
        self
    }

    pub fn with_ramp(mut self, steps: u32, interval: Duration) -> Self {
        self.ramp_steps = steps.max(1);
        self.ramp_interval = interval;
        self
    }

    pub fn curve(&self) -> VolumeCurve {
        self.curve
    }

    /// Pull the hardware level into range and announce it
    pub async fn initialize(&self) -> HubResult<VolumeStatus> {
        let hardware = self.read_hardware().await?;
        let clamped = self.curve.clamp_hardware(hardware);
        if clamped != hardware {
            info!(
                "Hardware volume {} outside {}..={}, clamping to {}",
                hardware, self.curve.min, self.curve.max, clamped
            );
            self.write_hardware(clamped).await?;
        }
        self.publish_status(false, true).await
    }

    pub async fn status(
        &self,
        show_volume_bar: bool,
        is_initial_status: bool,
    ) -> HubResult<VolumeStatus> {
        let hardware = self.read_hardware().await?;
        Ok(VolumeStatus {
            volume: self.curve.to_display(hardware),
            hardware_volume: hardware,
            show_volume_bar,
            is_initial_status,
        })
    }

    /// Announce the level without popping the volume bar
    pub async fn get_volume(&self) -> HubResult<VolumeStatus> {
        self.publish_status(false, true).await
    }

    /// Set an absolute display level. Returns false when the service is disabled.
    pub async fn set_volume(&self, level: i32) -> HubResult<bool> {
        if !self.is_enabled() {
            debug!("Volume service disabled, ignoring set_volume({})", level);
            return Ok(false);
        }

        let _ramp = self.ramp.lock().await;
        let hardware = self.curve.to_hardware(level);
        debug!("Set volume: display {} -> hardware {}", level, hardware);
        self.write_hardware(hardware).await?;
        self.publish_status(true, false).await?;
        Ok(true)
    }

    /// Move `delta` steps up or down in `ramp_steps` increments.
    ///
    /// Returns false when the service is disabled or a ramp is already running.
    pub async fn adjust_volume(&self, delta: i32) -> HubResult<bool> {
        if !self.is_enabled() {
            debug!("Volume service disabled, ignoring adjust_volume({})", delta);
            return Ok(false);
        }

        let Ok(_ramp) = self.ramp.try_lock() else {
            debug!("Volume ramp in progress, dropping adjust_volume({})", delta);
            return Ok(false);
        };

        let current = self.read_hardware().await?;
        let current_display = self.curve.to_display(current);
        let target_display = current_display
            .saturating_add(delta.saturating_mul(self.step))
            .clamp(0, DISPLAY_MAX);
        let target = self.curve.to_hardware(target_display);
        let per_step = (target - current) as f64 / self.ramp_steps as f64;

        for i in 0..self.ramp_steps {
            let next = (current as f64 + per_step * (i + 1) as f64).round() as i32;
            self.write_hardware(self.curve.clamp_hardware(next)).await?;
            self.publish_status(true, false).await?;
            if i + 1 < self.ramp_steps {
                tokio::time::sleep(self.ramp_interval).await;
            }
        }
        Ok(true)
    }

    async fn publish_status(
        &self,
        show_volume_bar: bool,
        is_initial_status: bool,
    ) -> HubResult<VolumeStatus> {
        let status = self.status(show_volume_bar, is_initial_status).await?;
        let data = serde_json::to_value(&status).unwrap_or_default();
        self.hub
            .publish(&Topic::new(VOLUME_TOPIC), Envelope::new("volume_status", data));
        Ok(status)
    }

    async fn read_hardware(&self) -> HubResult<i32> {
        bounded("read mixer", MIXER_TIMEOUT, self.mixer.get()).await
    }

    async fn write_hardware(&self, level: i32) -> HubResult<()> {
        bounded("write mixer", MIXER_TIMEOUT, self.mixer.set(level)).await
    }
}

#[async_trait]
impl ToggleableService for VolumeService {
    fn id(&self) -> &str {
        VOLUME_TOPIC
    }

    async fn enable(&self) -> Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceChangeHandler for VolumeService {
    fn name(&self) -> &str {
        VOLUME_TOPIC
    }

    async fn on_source_changed(&self, _old: Option<&str>, _new: Option<&str>) -> Result<()> {
        self.publish_status(false, true).await?;
        Ok(())
    }
}
