//! Broadcast hub for fanning out state to connected UI clients
//!
//! Observers subscribe to exactly one topic. Every message published to a
//! topic is also copied to the reserved `global` topic, tagged with its origin.
//! Delivery is best-effort per observer: a failed send never blocks the
//! others, and the failing observer is reaped on the spot.

pub mod reconnect;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};
pub use reconnect::{ReconnectBudget, ReconnectPolicy};

/// Name of the topic that receives a copy of every message
pub const GLOBAL_TOPIC: &str = "global";

/// Default interval between liveness pings
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Topic / Envelope
// =============================================================================

/// A named broadcast channel (`global` or a per-service name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn global() -> Self {
        Self(GLOBAL_TOPIC.to_string())
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_TOPIC
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Outbound message shape: `{ type, data }`, plus the origin topic when
/// delivered through the global feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            topic: None,
        }
    }

    /// Liveness ping
    pub fn ping() -> Self {
        Self::new("ping", Value::Null)
    }

    pub fn error(service: &str, message: impl Into<String>) -> Self {
        Self::new(
            "error",
            serde_json::json!({ "service": service, "error": message.into() }),
        )
    }

    pub fn with_topic(mut self, topic: &Topic) -> Self {
        self.topic = Some(topic.clone());
        self
    }
}

// =============================================================================
// Observers
// =============================================================================

/// Identifier handed out on subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Delivery side of a connected client.
///
/// `deliver` must not block: it enqueues the message for the client's writer
/// and reports an error when the client is gone or cannot keep up.
#[async_trait]
pub trait ObserverTransport: Send + Sync {
    /// Accept the connection before it is registered
    async fn handshake(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn deliver(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Observer backed by a bounded queue drained by a connection writer task
pub struct ChannelObserver {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelObserver {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ObserverTransport for ChannelObserver {
    async fn handshake(&self) -> anyhow::Result<()> {
        if self.tx.is_closed() {
            return Err(anyhow!("connection closed before registration"));
        }
        Ok(())
    }

    fn deliver(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.tx.try_send(envelope.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("outbound queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("connection closed"),
        })
    }
}

/// Handle returned by [`BroadcastHub::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observer {
    pub id: ObserverId,
    pub topic: Topic,
}

struct Subscription {
    id: ObserverId,
    transport: Arc<dyn ObserverTransport>,
}

// =============================================================================
// BroadcastHub
// =============================================================================

/// Per-topic observer sets plus reconnect budgets
pub struct BroadcastHub {
    /// Observers per topic, in subscription order
    topics: Mutex<HashMap<Topic, Vec<Subscription>>>,
    budgets: Mutex<HashMap<Topic, ReconnectBudget>>,
    policy: ReconnectPolicy,
    next_id: AtomicU64,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl BroadcastHub {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            budgets: Mutex::new(HashMap::new()),
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer under `topic` after its handshake succeeds
    pub async fn subscribe(
        &self,
        topic: Topic,
        transport: Arc<dyn ObserverTransport>,
    ) -> HubResult<Observer> {
        transport
            .handshake()
            .await
            .map_err(|e| HubError::transient(format!("observer handshake on {}", topic), e))?;

        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let total = {
            let mut topics = self.topics.lock();
            let set = topics.entry(topic.clone()).or_default();
            set.push(Subscription { id, transport });
            set.len()
        };
        info!("{} subscribed to {} ({} on topic)", id, topic, total);
        Ok(Observer { id, topic })
    }

    /// Remove an observer. Returns false when it was not subscribed.
    pub fn unsubscribe(&self, observer: &Observer) -> bool {
        let removed = self.remove(&observer.topic, observer.id);
        if removed {
            info!("{} unsubscribed from {}", observer.id, observer.topic);
        }
        removed
    }

    fn remove(&self, topic: &Topic, id: ObserverId) -> bool {
        let mut topics = self.topics.lock();
        let Some(set) = topics.get_mut(topic) else {
            return false;
        };
        let before = set.len();
        set.retain(|s| s.id != id);
        let removed = set.len() != before;
        if set.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Deliver to every observer of `topic`, and a tagged copy to every
    /// observer of `global`. Returns the number of successful deliveries.
    pub fn publish(&self, topic: &Topic, envelope: Envelope) -> usize {
        let tagged = (!topic.is_global()).then(|| envelope.clone().with_topic(topic));

        let mut topics = self.topics.lock();
        let mut delivered = deliver_all(&mut topics, topic, &envelope);
        if let Some(tagged) = tagged {
            delivered += deliver_all(&mut topics, &Topic::global(), &tagged);
        }
        debug!(
            "Published {} on {} to {} observer(s)",
            envelope.kind, topic, delivered
        );
        delivered
    }

    /// Deliver to a single observer, reaping it on failure
    pub fn send_to(&self, observer: &Observer, envelope: Envelope) -> bool {
        let transport = {
            let topics = self.topics.lock();
            topics.get(&observer.topic).and_then(|set| {
                set.iter()
                    .find(|s| s.id == observer.id)
                    .map(|s| s.transport.clone())
            })
        };
        let Some(transport) = transport else {
            return false;
        };
        match transport.deliver(&envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!("Reaping {} on {}: {}", observer.id, observer.topic, e);
                self.remove(&observer.topic, observer.id);
                false
            }
        }
    }

    /// Send a liveness ping to every observer. Returns how many were reaped.
    pub fn ping_all(&self) -> usize {
        let ping = Envelope::ping();
        let mut topics = self.topics.lock();
        let mut reaped = 0;
        for (topic, set) in topics.iter_mut() {
            let before = set.len();
            set.retain(|s| match s.transport.deliver(&ping) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Liveness ping failed for {} on {}: {}", s.id, topic, e);
                    false
                }
            });
            reaped += before - set.len();
        }
        topics.retain(|_, set| !set.is_empty());
        reaped
    }

    /// Ping all observers every `interval` until cancelled
    pub async fn run_liveness(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; clients were just greeted on subscribe
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Liveness pings stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let reaped = self.ping_all();
                    if reaped > 0 {
                        info!("Liveness ping reaped {} observer(s)", reaped);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Reconnect bookkeeping
    // =========================================================================

    /// Record a failed (re)connect attempt for `topic`.
    ///
    /// Returns the backoff to wait before the next attempt, or
    /// `ReconnectExhausted` once the topic's budget is spent.
    pub fn record_failure(&self, topic: &Topic) -> HubResult<Duration> {
        let mut budgets = self.budgets.lock();
        let budget = budgets.entry(topic.clone()).or_default();
        match budget.fail(&self.policy) {
            Some(delay) => {
                debug!(
                    "Reconnect failure {}/{} on {}, next attempt in {:?}",
                    budget.failures(),
                    self.policy.max_attempts,
                    topic,
                    delay
                );
                Ok(delay)
            }
            None => Err(HubError::ReconnectExhausted {
                topic: topic.to_string(),
                attempts: budget.failures(),
            }),
        }
    }

    /// Reset the topic's budget after a clean connect
    pub fn record_success(&self, topic: &Topic) {
        let mut budgets = self.budgets.lock();
        if let Some(budget) = budgets.get_mut(topic) {
            if budget.failures() > 0 {
                debug!("Reconnect budget reset for {}", topic);
            }
            budget.reset();
        }
    }

    pub fn reconnect_failures(&self, topic: &Topic) -> u32 {
        self.budgets
            .lock()
            .get(topic)
            .map(|b| b.failures())
            .unwrap_or(0)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn observer_count(&self, topic: &Topic) -> usize {
        self.topics.lock().get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Observer counts per topic (sorted by topic name)
    pub fn observer_counts(&self) -> BTreeMap<String, usize> {
        self.topics
            .lock()
            .iter()
            .map(|(topic, set)| (topic.to_string(), set.len()))
            .collect()
    }
}

/// Deliver to one topic's observers, dropping those whose send fails
fn deliver_all(
    topics: &mut HashMap<Topic, Vec<Subscription>>,
    topic: &Topic,
    envelope: &Envelope,
) -> usize {
    let Some(set) = topics.get_mut(topic) else {
        return 0;
    };
    let before = set.len();
    set.retain(|s| match s.transport.deliver(envelope) {
        Ok(()) => true,
        Err(e) => {
            warn!("Reaping {} on {}: {}", s.id, topic, e);
            false
        }
    });
    let delivered = set.len();
    if delivered < before {
        info!(
            "Reaped {} dead observer(s) on {}",
            before - delivered,
            topic
        );
    }
    if set.is_empty() {
        topics.remove(topic);
    }
    delivered
}

/// Shared hub wrapped in Arc for thread-safe sharing
pub type SharedHub = Arc<BroadcastHub>;
