//! Shared fixtures for integration tests: scripted sources, a fake presence
//! daemon, and helpers for observing hub traffic.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use audio_hub::arbiter::SourceArbiter;
use audio_hub::bus::{BroadcastHub, ChannelObserver, Envelope, Topic};
use audio_hub::notifier::{SourceChangeHandler, SourceChangeNotifier};
use audio_hub::presence::{DeviceInfo, PresenceCollaborator};
use audio_hub::sources::{ActivatableSource, SourceRegistry};

// =============================================================================
// Sources
// =============================================================================

/// Source that counts calls and can be told to fail either transition
pub struct MockSource {
    id: String,
    fail_activate: bool,
    fail_deactivate: bool,
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
    /// Shared call log across sources: "activate:<id>" / "deactivate:<id>"
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl MockSource {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, None))
    }

    /// Activation always fails
    pub fn failing(id: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_activate: true,
            ..Self::build(id, None)
        })
    }

    /// Deactivation always fails
    pub fn stubborn(id: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_deactivate: true,
            ..Self::build(id, None)
        })
    }

    pub fn logged(id: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self::build(id, Some(log)))
    }

    fn build(id: &str, log: Option<Arc<Mutex<Vec<String>>>>) -> Self {
        Self {
            id: id.to_string(),
            fail_activate: false,
            fail_deactivate: false,
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
            log,
        }
    }

    pub fn activation_count(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivation_count(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActivatableSource for MockSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn activate(&self) -> Result<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().push(format!("activate:{}", self.id));
        }
        if self.fail_activate {
            return Err(anyhow!("{} refused to start", self.id));
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().push(format!("deactivate:{}", self.id));
        }
        if self.fail_deactivate {
            return Err(anyhow!("{} would not stop", self.id));
        }
        Ok(())
    }
}

/// Source whose activation parks until the test opens the gate
pub struct GatedSource {
    id: String,
    pub activations: AtomicUsize,
    /// Signalled when activation has started
    pub entered: Notify,
    /// Opened by the test to let activation finish
    pub gate: Notify,
}

impl GatedSource {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            activations: AtomicUsize::new(0),
            entered: Notify::new(),
            gate: Notify::new(),
        })
    }
}

#[async_trait]
impl ActivatableSource for GatedSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn activate(&self) -> Result<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Source change recording
// =============================================================================

/// Records every (old, new) notification it receives
#[derive(Default)]
pub struct RecordingHandler {
    pub changes: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl RecordingHandler {
    pub fn changes(&self) -> Vec<(Option<String>, Option<String>)> {
        self.changes.lock().clone()
    }
}

#[async_trait]
impl SourceChangeHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_source_changed(&self, old: Option<&str>, new: Option<&str>) -> Result<()> {
        self.changes
            .lock()
            .push((old.map(String::from), new.map(String::from)));
        Ok(())
    }
}

// =============================================================================
// Presence
// =============================================================================

/// Fake device daemon: a connected list plus a record of disconnects
#[derive(Default)]
pub struct MockPresence {
    pub connected: Mutex<Vec<DeviceInfo>>,
    pub disconnected: Mutex<Vec<String>>,
    pub unavailable: std::sync::atomic::AtomicBool,
}

impl MockPresence {
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Arc<Self> {
        Arc::new(Self {
            connected: Mutex::new(devices),
            ..Self::default()
        })
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().clone()
    }
}

#[async_trait]
impl PresenceCollaborator for MockPresence {
    async fn list_connected(&self) -> Result<Vec<DeviceInfo>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("org.bluez not running"));
        }
        Ok(self.connected.lock().clone())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.disconnected.lock().push(address.to_string());
        self.connected.lock().retain(|d| d.address != address);
        Ok(())
    }
}

// =============================================================================
// Wiring helpers
// =============================================================================

pub struct Harness {
    pub hub: Arc<BroadcastHub>,
    pub arbiter: Arc<SourceArbiter>,
    pub recorder: Arc<RecordingHandler>,
}

/// Hub + arbiter over the given sources, with a recording notifier
pub fn harness(sources: Vec<Arc<dyn ActivatableSource>>) -> Harness {
    let hub = Arc::new(BroadcastHub::default());
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source).expect("unique source ids");
    }

    let recorder = Arc::new(RecordingHandler::default());
    let mut notifier = SourceChangeNotifier::new();
    notifier.register(recorder.clone());

    let arbiter = Arc::new(SourceArbiter::new(
        Arc::new(registry),
        notifier,
        hub.clone(),
    ));
    Harness {
        hub,
        arbiter,
        recorder,
    }
}

/// Subscribe a channel-backed observer to `topic`
pub async fn observe(hub: &BroadcastHub, topic: &str) -> mpsc::Receiver<Envelope> {
    let (transport, rx) = ChannelObserver::new(64);
    hub.subscribe(Topic::new(topic), Arc::new(transport))
        .await
        .expect("subscribe");
    rx
}

/// Everything already queued on `rx`
pub fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

/// Message kinds already queued on `rx`
pub fn drain_kinds(rx: &mut mpsc::Receiver<Envelope>) -> Vec<String> {
    drain(rx).into_iter().map(|e| e.kind).collect()
}
