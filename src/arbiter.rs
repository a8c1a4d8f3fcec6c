//! SourceArbiter - owner of the single "current source" slot
//!
//! At most one switch runs at a time. A request that arrives while a switch is
//! in flight is rejected immediately (busy) rather than queued, so a stale
//! request can never run against a target that no longer matters.
//!
//! A switch always runs in this order:
//! 1. mark in progress, publish `switching`
//! 2. deactivate the old source (failure is logged, the switch continues)
//! 3. activate the new source
//! 4. commit the new source, or no source when activation failed
//! 5. notify dependent services if the committed value changed
//! 6. clear the in-progress flag, publish `state`

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bus::{BroadcastHub, Envelope, Topic};
use crate::error::{bounded, HubError, HubResult};
use crate::notifier::SourceChangeNotifier;
use crate::sources::{ActivatableSource, SourceRegistry};

/// Pseudo source id meaning "release the output"
pub const NO_SOURCE: &str = "none";

/// Topic carrying arbitration state
pub const AUDIO_TOPIC: &str = "audio";

/// Default budget for one activate/deactivate call
pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of hub truth
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArbitrationState {
    pub current_source: Option<String>,
    pub switch_in_progress: bool,
}

pub struct SourceArbiter {
    state: Mutex<ArbitrationState>,
    registry: Arc<SourceRegistry>,
    notifier: SourceChangeNotifier,
    hub: Arc<BroadcastHub>,
    timeout: Duration,
}

impl SourceArbiter {
    pub fn new(
        registry: Arc<SourceRegistry>,
        notifier: SourceChangeNotifier,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            state: Mutex::new(ArbitrationState::default()),
            registry,
            notifier,
            hub,
            timeout: DEFAULT_ACTIVATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Non-blocking snapshot. During a switch this shows the pre-switch source.
    pub fn current_state(&self) -> ArbitrationState {
        self.state.lock().clone()
    }

    pub fn is_current(&self, source_id: &str) -> bool {
        self.state.lock().current_source.as_deref() == Some(source_id)
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Make `source_id` the active source.
    ///
    /// Returns `Ok(false)` when another switch is in flight, `Ok(true)` when the
    /// switch completed or was a no-op, and an error when the id is unknown or
    /// activation failed (the hub is then left with no active source).
    pub async fn switch_to(&self, source_id: &str) -> HubResult<bool> {
        if source_id == NO_SOURCE {
            return self.deactivate_current().await;
        }

        let target = self
            .registry
            .get(source_id)
            .ok_or_else(|| HubError::not_found("source", source_id))?;

        let old = {
            let mut state = self.state.lock();
            if state.switch_in_progress {
                debug!("Switch to {} rejected: switch in progress", source_id);
                return Ok(false);
            }
            if state.current_source.as_deref() == Some(source_id) {
                debug!("Source {} already active", source_id);
                return Ok(true);
            }
            state.switch_in_progress = true;
            state.current_source.clone()
        };

        let guard = SwitchGuard::new(self);
        self.transition(guard, old, Some(target)).await
    }

    /// Release the output, but only if `source_id` currently owns it
    pub async fn release(&self, source_id: &str) -> HubResult<bool> {
        if !self.is_current(source_id) {
            debug!("Release of {} ignored: not the current source", source_id);
            return Ok(true);
        }
        self.deactivate_current().await
    }

    /// Switch to no source
    pub async fn deactivate_current(&self) -> HubResult<bool> {
        let old = {
            let mut state = self.state.lock();
            if state.switch_in_progress {
                debug!("Deactivation rejected: switch in progress");
                return Ok(false);
            }
            if state.current_source.is_none() {
                return Ok(true);
            }
            state.switch_in_progress = true;
            state.current_source.clone()
        };

        let guard = SwitchGuard::new(self);
        self.transition(guard, old, None).await
    }

    async fn transition(
        &self,
        mut guard: SwitchGuard<'_>,
        old: Option<String>,
        target: Option<Arc<dyn ActivatableSource>>,
    ) -> HubResult<bool> {
        let target_id = target.as_ref().map(|t| t.id().to_string());
        info!("Switching source: {:?} -> {:?}", old, target_id);

        self.publish(Envelope::new(
            "switching",
            json!({
                "current_source": old,
                "target_source": target_id,
                "is_switching": true,
            }),
        ));

        if let Some(old_id) = old.as_deref() {
            if let Some(old_source) = self.registry.get(old_id) {
                let op = format!("deactivate {}", old_id);
                if let Err(e) = bounded(&op, self.timeout, old_source.deactivate()).await {
                    // The old source is considered relinquished either way
                    warn!("{}, continuing switch", e);
                }
            }
        }

        let outcome = match &target {
            Some(source) => {
                let op = format!("activate {}", source.id());
                bounded(&op, self.timeout, source.activate())
                    .await
                    .map(|()| Some(source.id().to_string()))
            }
            None => Ok(None),
        };

        let committed = match &outcome {
            Ok(new) => new.clone(),
            Err(e) => {
                warn!("{}, no source is active", e);
                None
            }
        };

        guard.commit(committed.clone());

        if committed != old {
            self.notifier
                .notify(old.as_deref(), committed.as_deref())
                .await;
        }

        guard.finish();
        self.publish_state(committed.as_deref());

        match outcome {
            Ok(_) => {
                info!("Source switch complete: {:?}", committed);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn publish(&self, envelope: Envelope) {
        self.hub.publish(&Topic::new(AUDIO_TOPIC), envelope);
    }

    fn publish_state(&self, current: Option<&str>) {
        self.publish(Envelope::new(
            "state",
            json!({
                "current_source": current,
                "is_switching": false,
            }),
        ));
    }
}

/// Ends a switch. If the switching future is dropped before the outcome was
/// committed, the old source has already been asked to let go, so the hub
/// falls back to no source and still publishes the final `state`.
struct SwitchGuard<'a> {
    arbiter: &'a SourceArbiter,
    committed: bool,
    armed: bool,
}

impl<'a> SwitchGuard<'a> {
    fn new(arbiter: &'a SourceArbiter) -> Self {
        Self {
            arbiter,
            committed: false,
            armed: true,
        }
    }

    fn commit(&mut self, source: Option<String>) {
        self.arbiter.state.lock().current_source = source;
        self.committed = true;
    }

    fn finish(mut self) {
        self.arbiter.state.lock().switch_in_progress = false;
        self.armed = false;
    }
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let current = {
            let mut state = self.arbiter.state.lock();
            if !self.committed {
                state.current_source = None;
            }
            state.switch_in_progress = false;
            state.current_source.clone()
        };
        warn!(
            "Source switch abandoned mid-flight, settling on {:?}",
            current
        );
        self.arbiter.publish_state(current.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelObserver, GLOBAL_TOPIC};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Counted {
        id: &'static str,
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ActivatableSource for Counted {
        fn id(&self) -> &str {
            self.id
        }

        async fn activate(&self) -> Result<()> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(())
        }

        async fn deactivate(&self) -> Result<()> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn arbiter(sources: Vec<Arc<Counted>>) -> (Arc<SourceArbiter>, Arc<BroadcastHub>) {
        let hub = Arc::new(BroadcastHub::default());
        let mut registry = SourceRegistry::new();
        for source in sources {
            registry.register(source).unwrap();
        }
        let arbiter = SourceArbiter::new(
            Arc::new(registry),
            SourceChangeNotifier::new(),
            hub.clone(),
        );
        (Arc::new(arbiter), hub)
    }

    fn counted(id: &'static str) -> Arc<Counted> {
        Arc::new(Counted {
            id,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unknown_source_is_not_found_without_side_effects() {
        let (arbiter, hub) = arbiter(vec![counted("spotify")]);
        let (transport, mut rx) = ChannelObserver::new(8);
        hub.subscribe(Topic::new(GLOBAL_TOPIC), Arc::new(transport))
            .await
            .unwrap();

        assert_eq!(
            arbiter.switch_to("tape").await,
            Err(HubError::not_found("source", "tape"))
        );
        assert_eq!(arbiter.current_state(), ArbitrationState::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_none_deactivates_current() {
        let spotify = counted("spotify");
        let (arbiter, _hub) = arbiter(vec![spotify.clone()]);

        assert_eq!(arbiter.switch_to("spotify").await, Ok(true));
        assert_eq!(arbiter.switch_to(NO_SOURCE).await, Ok(true));

        assert_eq!(arbiter.current_state().current_source, None);
        assert_eq!(spotify.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_only_affects_owner() {
        let spotify = counted("spotify");
        let bluetooth = counted("bluetooth");
        let (arbiter, _hub) = arbiter(vec![spotify.clone(), bluetooth.clone()]);

        arbiter.switch_to("bluetooth").await.unwrap();
        assert_eq!(arbiter.release("spotify").await, Ok(true));
        assert!(arbiter.is_current("bluetooth"));
        assert_eq!(bluetooth.deactivations.load(Ordering::SeqCst), 0);

        assert_eq!(arbiter.release("bluetooth").await, Ok(true));
        assert_eq!(arbiter.current_state().current_source, None);
        assert_eq!(bluetooth.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deactivate_with_nothing_active_is_noop() {
        let (arbiter, hub) = arbiter(vec![counted("spotify")]);
        let (transport, mut rx) = ChannelObserver::new(8);
        hub.subscribe(Topic::new(AUDIO_TOPIC), Arc::new(transport))
            .await
            .unwrap();

        assert_eq!(arbiter.deactivate_current().await, Ok(true));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_switch_clears_flag() {
        let gate = Arc::new(Notify::new());
        let slow = Arc::new(Counted {
            id: "snapcast",
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (arbiter, _hub) = arbiter(vec![slow.clone()]);

        let task = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.switch_to("snapcast").await })
        };

        while slow.activations.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(arbiter.current_state().switch_in_progress);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let state = arbiter.current_state();
        assert!(!state.switch_in_progress);
        assert_eq!(state.current_source, None);
    }

    #[tokio::test]
    async fn test_abandoned_switch_away_from_active_source_settles_on_none() {
        let spotify = counted("spotify");
        let gate = Arc::new(Notify::new());
        let bluetooth = Arc::new(Counted {
            id: "bluetooth",
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (arbiter, hub) = arbiter(vec![spotify.clone(), bluetooth.clone()]);
        arbiter.switch_to("spotify").await.unwrap();

        let (transport, mut rx) = ChannelObserver::new(8);
        hub.subscribe(Topic::new(AUDIO_TOPIC), Arc::new(transport))
            .await
            .unwrap();

        let task = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.switch_to("bluetooth").await })
        };
        while bluetooth.activations.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        // Spotify was already told to stop, so it must not be reported as live
        assert_eq!(spotify.deactivations.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.current_state(), ArbitrationState::default());

        let mut kinds = Vec::new();
        let mut last = None;
        while let Ok(envelope) = rx.try_recv() {
            kinds.push(envelope.kind.clone());
            last = Some(envelope);
        }
        assert_eq!(kinds, vec!["switching", "state"]);
        let last = last.unwrap();
        assert!(last.data["current_source"].is_null());
        assert_eq!(last.data["is_switching"], false);

        // The hub is usable again
        assert_eq!(arbiter.switch_to("spotify").await, Ok(true));
        assert!(arbiter.is_current("spotify"));
    }
}
