//! SAFETY CRITICAL: volume regression tests
//!
//! The amplifier is driven in mixer percent. Anything above the curve's
//! hardware max is loud enough to damage drivers, so no input path (absolute
//! set, relative adjust, inbound JSON with odd numbers) may ever write a level
//! outside `min..=max`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use audio_hub::bus::BroadcastHub;
use audio_hub::router::ServiceRouter;
use audio_hub::sources::ActivatableSource;
use audio_hub::volume::{Mixer, VolumeCurve, VolumeService};
use common::{harness, MockSource};

/// Mixer that records every level written to it
struct RecordingMixer {
    level: Mutex<i32>,
    writes: Mutex<Vec<i32>>,
}

impl RecordingMixer {
    fn new(level: i32) -> Arc<Self> {
        Arc::new(Self {
            level: Mutex::new(level),
            writes: Mutex::new(Vec::new()),
        })
    }

    fn writes(&self) -> Vec<i32> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl Mixer for RecordingMixer {
    async fn get(&self) -> Result<i32> {
        Ok(*self.level.lock())
    }

    async fn set(&self, level: i32) -> Result<()> {
        *self.level.lock() = level;
        self.writes.lock().push(level);
        Ok(())
    }
}

fn curve() -> VolumeCurve {
    VolumeCurve::new(40, 98)
}

fn service(mixer: Arc<RecordingMixer>) -> VolumeService {
    VolumeService::new(curve(), mixer, Arc::new(BroadcastHub::default()))
        .with_ramp(3, Duration::ZERO)
}

fn assert_within_curve(writes: &[i32]) {
    let curve = curve();
    for level in writes {
        assert!(
            (curve.min..=curve.max).contains(level),
            "mixer written with {} outside {}..={}",
            level,
            curve.min,
            curve.max
        );
    }
}

#[test]
fn display_extremes_map_to_hardware_range() {
    let curve = curve();
    assert_eq!(curve.to_hardware(0), 40);
    assert_eq!(curve.to_hardware(100), 98);
    assert_eq!(curve.to_hardware(-20), 40);
    assert_eq!(curve.to_hardware(250), 98);
    assert_eq!(curve.to_hardware(i32::MAX), 98);
    assert_eq!(curve.to_hardware(i32::MIN), 40);
}

#[test]
fn every_display_value_stays_in_range() {
    let curve = curve();
    for display in -200..=300 {
        let hardware = curve.to_hardware(display);
        assert!((curve.min..=curve.max).contains(&hardware), "display {}", display);
    }
}

#[tokio::test]
async fn critical_set_volume_never_exceeds_max() {
    let mixer = RecordingMixer::new(60);
    let volume = service(mixer.clone());

    for display in [100, 101, 1000, -5, 50] {
        assert_eq!(volume.set_volume(display).await, Ok(true));
    }

    assert_eq!(mixer.writes(), vec![98, 98, 98, 40, 69]);
    assert_within_curve(&mixer.writes());
}

#[tokio::test]
async fn adjust_past_the_top_stops_at_max() {
    let mixer = RecordingMixer::new(95);
    let volume = service(mixer.clone());

    assert_eq!(volume.adjust_volume(50).await, Ok(true));

    let writes = mixer.writes();
    assert_eq!(writes.last(), Some(&98));
    assert_within_curve(&writes);
}

#[tokio::test]
async fn adjust_below_the_bottom_stops_at_min() {
    let mixer = RecordingMixer::new(42);
    let volume = service(mixer.clone());

    assert_eq!(volume.adjust_volume(-50).await, Ok(true));

    let writes = mixer.writes();
    assert_eq!(writes.last(), Some(&40));
    assert_within_curve(&writes);
}

#[tokio::test]
async fn initialize_pulls_hot_hardware_level_down() {
    // Mixer left at 100% by something else on the machine
    let mixer = RecordingMixer::new(100);
    let volume = service(mixer.clone());

    let status = volume.initialize().await.unwrap();

    assert_eq!(mixer.writes(), vec![98]);
    assert_eq!(status.hardware_volume, 98);
    assert_eq!(status.volume, 100);
}

#[tokio::test]
async fn inbound_messages_with_odd_numbers_stay_in_range() {
    let h = harness(vec![MockSource::new("spotify") as Arc<dyn ActivatableSource>]);
    let mixer = RecordingMixer::new(60);
    let volume = Arc::new(service(mixer.clone()));
    let router = ServiceRouter::new(h.hub.clone(), h.arbiter.clone()).with_volume(volume);

    for text in [
        r#"{"type":"set_volume","data":{"volume":1e12}}"#,
        r#"{"type":"set_volume","data":{"volume":-1e12}}"#,
        r#"{"type":"set_volume","volume":99.6}"#,
        r#"{"type":"adjust_volume","data":{"delta":2147483647}}"#,
    ] {
        assert_eq!(router.handle_text("volume", text).await, None, "{}", text);
    }

    let writes = mixer.writes();
    assert!(!writes.is_empty());
    assert_within_curve(&writes);
}
