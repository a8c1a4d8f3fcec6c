//! Spotify Connect daemon (go-librespot) poller
//!
//! The daemon exposes `GET /status`. A session counts as connected when the
//! player is not stopped and a user is logged in. Connect/disconnect
//! transitions claim or release the `spotify` source through the arbiter.
//! Track metadata from the same payload is published as `playback_status`,
//! and transport commands go to `POST /player/{playpause,next,prev}`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::StatusPollCollaborator;
use crate::arbiter::SourceArbiter;
use crate::bus::{BroadcastHub, Envelope, Topic};
use crate::error::{bounded, HubError, HubResult};

pub const SPOTIFY_TOPIC: &str = "spotify";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpotifyStatus {
    pub connected: bool,
    pub username: Option<String>,
    pub device_name: Option<String>,
    /// Published separately as `playback_status`
    #[serde(skip)]
    pub playback: PlaybackStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStatus {
    pub track_name: Option<String>,
    pub artist_names: Vec<String>,
    pub album_name: Option<String>,
    pub album_cover_url: Option<String>,
    /// Milliseconds
    pub duration: Option<u64>,
    pub is_playing: bool,
    pub volume: u32,
}

/// Raw `/status` payload (only the fields we read)
#[derive(Debug, Deserialize)]
struct LibrespotStatus {
    #[serde(default = "stopped_by_default")]
    stopped: bool,
    #[serde(default = "stopped_by_default")]
    paused: bool,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    volume: u32,
    #[serde(default)]
    track: Option<LibrespotTrack>,
}

#[derive(Debug, Default, Deserialize)]
struct LibrespotTrack {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    artist_names: Vec<String>,
    #[serde(default)]
    album_name: Option<String>,
    #[serde(default)]
    album_cover_url: Option<String>,
    #[serde(default)]
    duration: Option<u64>,
}

fn stopped_by_default() -> bool {
    true
}

impl From<LibrespotStatus> for SpotifyStatus {
    fn from(raw: LibrespotStatus) -> Self {
        let track = raw.track.unwrap_or_default();
        Self {
            connected: !raw.stopped && raw.username.is_some(),
            username: raw.username,
            device_name: raw.device_name,
            playback: PlaybackStatus {
                track_name: track.name,
                artist_names: track.artist_names,
                album_name: track.album_name,
                album_cover_url: track.album_cover_url,
                duration: track.duration,
                is_playing: !(raw.stopped || raw.paused),
                volume: raw.volume,
            },
        }
    }
}

// =============================================================================
// Player control
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerAction {
    PlayPause,
    Next,
    Previous,
}

impl PlayerAction {
    fn path(self) -> &'static str {
        match self {
            PlayerAction::PlayPause => "/player/playpause",
            PlayerAction::Next => "/player/next",
            PlayerAction::Previous => "/player/prev",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlayerAction::PlayPause => "play_pause",
            PlayerAction::Next => "next_track",
            PlayerAction::Previous => "previous_track",
        }
    }
}

impl fmt::Display for PlayerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport commands on the daemon's player
#[async_trait]
pub trait PlayerControl: Send + Sync {
    async fn send_action(&self, action: PlayerAction) -> Result<()>;
}

// =============================================================================
// LibrespotClient
// =============================================================================

pub struct LibrespotClient {
    client: Client,
    base_url: String,
}

impl LibrespotClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", host, port),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl StatusPollCollaborator for LibrespotClient {
    type Status = SpotifyStatus;

    async fn get_status(&self) -> Result<SpotifyStatus> {
        let url = format!("{}/status", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("librespot status request failed: {}", response.status()));
        }
        let raw: LibrespotStatus = response.json().await?;
        Ok(raw.into())
    }
}

#[async_trait]
impl PlayerControl for LibrespotClient {
    async fn send_action(&self, action: PlayerAction) -> Result<()> {
        let url = format!("{}{}", self.base_url, action.path());
        let response = self.client.post(&url).json(&json!({})).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("librespot {} failed: {}", action, response.status()));
        }
        Ok(())
    }
}

// =============================================================================
// SpotifyPoller
// =============================================================================

pub struct SpotifyPoller {
    source_id: String,
    daemon: Arc<dyn StatusPollCollaborator<Status = SpotifyStatus>>,
    control: Option<Arc<dyn PlayerControl>>,
    arbiter: Arc<SourceArbiter>,
    hub: Arc<BroadcastHub>,
    interval: Duration,
    timeout: Duration,
    last: Mutex<SpotifyStatus>,
}

impl SpotifyPoller {
    pub fn new(
        daemon: Arc<dyn StatusPollCollaborator<Status = SpotifyStatus>>,
        arbiter: Arc<SourceArbiter>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            source_id: SPOTIFY_TOPIC.to_string(),
            daemon,
            control: None,
            arbiter,
            hub,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: Duration::from_secs(5),
            last: Mutex::new(SpotifyStatus::default()),
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn with_control(mut self, control: Arc<dyn PlayerControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn status(&self) -> SpotifyStatus {
        self.last.lock().clone()
    }

    /// Poll once, acting on transitions and publishing when the status changed
    pub async fn poll_once(&self) -> HubResult<SpotifyStatus> {
        let status = bounded("spotify status", self.timeout, self.daemon.get_status()).await?;
        self.apply(status.clone(), false).await;
        Ok(status)
    }

    /// Re-poll and publish even when nothing changed
    pub async fn refresh(&self) -> HubResult<SpotifyStatus> {
        match bounded("spotify status", self.timeout, self.daemon.get_status()).await {
            Ok(status) => {
                self.apply(status.clone(), true).await;
                Ok(status)
            }
            Err(e) => {
                self.mark_unreachable();
                self.publish(&self.status());
                Err(e)
            }
        }
    }

    /// Send a transport command, then re-poll so clients see its effect
    pub async fn control(&self, action: PlayerAction) -> HubResult<SpotifyStatus> {
        let Some(control) = &self.control else {
            return Err(HubError::not_found("player control", SPOTIFY_TOPIC));
        };
        info!("Spotify {}", action);
        bounded(action.as_str(), self.timeout, control.send_action(action)).await?;
        self.refresh().await
    }

    async fn apply(&self, status: SpotifyStatus, force_publish: bool) {
        let (session_changed, playback_changed, was_connected) = {
            let mut last = self.last.lock();
            let previous = std::mem::replace(&mut *last, status.clone());
            (
                previous.connected != status.connected
                    || previous.username != status.username
                    || previous.device_name != status.device_name,
                previous.playback != status.playback,
                previous.connected,
            )
        };

        if was_connected != status.connected {
            if status.connected {
                info!(
                    "Spotify session started ({:?} on {:?})",
                    status.username, status.device_name
                );
                match self.arbiter.switch_to(&self.source_id).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Spotify connected while a switch was in progress"),
                    Err(e) => warn!("Could not activate {}: {}", self.source_id, e),
                }
            } else {
                info!("Spotify session ended");
                match self.arbiter.release(&self.source_id).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Spotify disconnected while a switch was in progress"),
                    Err(e) => warn!("Could not release {}: {}", self.source_id, e),
                }
            }
        }

        if session_changed || force_publish {
            self.publish(&status);
        }
        if playback_changed || force_publish {
            self.publish_playback(&status.playback);
        }
    }

    /// Daemon unreachable: show the session as gone without touching the source
    fn mark_unreachable(&self) {
        let was_connected = {
            let mut last = self.last.lock();
            let was_connected = last.connected;
            *last = SpotifyStatus::default();
            was_connected
        };
        if was_connected {
            self.publish(&SpotifyStatus::default());
        }
    }

    fn publish(&self, status: &SpotifyStatus) {
        let data = serde_json::to_value(status).unwrap_or_default();
        self.hub
            .publish(&Topic::new(SPOTIFY_TOPIC), Envelope::new("spotify_status", data));
    }

    fn publish_playback(&self, playback: &PlaybackStatus) {
        let data = serde_json::to_value(playback).unwrap_or_default();
        self.hub
            .publish(&Topic::new(SPOTIFY_TOPIC), Envelope::new("playback_status", data));
    }

    /// Poll until cancelled. Ends with `ReconnectExhausted` when the daemon
    /// stays unreachable past the hub's reconnect budget.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> HubResult<()> {
        let topic = Topic::new(SPOTIFY_TOPIC);
        info!("Polling Spotify daemon every {:?}", self.interval);

        loop {
            let delay = match self.poll_once().await {
                Ok(_) => {
                    self.hub.record_success(&topic);
                    self.interval
                }
                Err(e) => {
                    debug!("Spotify poll failed: {}", e);
                    self.mark_unreachable();
                    match self.hub.record_failure(&topic) {
                        Ok(backoff) => {
                            warn!("Spotify daemon unreachable ({}), retrying in {:?}", e, backoff);
                            backoff
                        }
                        Err(exhausted) => {
                            error!("Giving up on Spotify daemon: {}", exhausted);
                            self.hub.publish(
                                &topic,
                                Envelope::error(SPOTIFY_TOPIC, exhausted.to_string()),
                            );
                            return Err(exhausted);
                        }
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Spotify poller stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl std::fmt::Debug for SpotifyPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyPoller")
            .field("source_id", &self.source_id)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Terminal outcome of the poll loop, for callers that only need to log it
pub fn describe_exit(result: &HubResult<()>) -> String {
    match result {
        Ok(()) => "stopped".to_string(),
        Err(HubError::ReconnectExhausted { attempts, .. }) => {
            format!("gave up after {} failed polls", attempts)
        }
        Err(e) => e.to_string(),
    }
}
