//! Inbound message routing
//!
//! Every client connection is bound to one service name. Payloads are
//! `{ type, data }` records, decoded here into a closed set of commands per
//! service. Unknown types are logged and ignored so older hubs keep working
//! with newer clients.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::arbiter::{ArbitrationState, SourceArbiter, AUDIO_TOPIC};
use crate::bus::{BroadcastHub, Envelope, Topic};
use crate::daemons::snapcast::SnapcastMonitor;
use crate::daemons::spotify::{PlayerAction, SpotifyPoller};
use crate::error::HubError;
use crate::presence::{DevicePresenceState, PresenceTracker};
use crate::sources::services::ServiceRegistry;
use crate::volume::VolumeService;

// =============================================================================
// Service names
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Audio,
    Bluetooth,
    Volume,
    Snapcast,
    Spotify,
    Global,
}

impl ServiceName {
    pub const ALL: [ServiceName; 6] = [
        ServiceName::Audio,
        ServiceName::Bluetooth,
        ServiceName::Volume,
        ServiceName::Snapcast,
        ServiceName::Spotify,
        ServiceName::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Audio => "audio",
            ServiceName::Bluetooth => "bluetooth",
            ServiceName::Volume => "volume",
            ServiceName::Snapcast => "snapcast",
            ServiceName::Spotify => "spotify",
            ServiceName::Global => "global",
        }
    }

    pub fn topic(&self) -> Topic {
        Topic::new(self.as_str())
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| HubError::not_found("service", s))
    }
}

// =============================================================================
// Inbound payloads
// =============================================================================

/// `{ type, data }`. Older clients put fields at the top level, so any extra
/// keys are kept and consulted after `data`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundPayload {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl InboundPayload {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            rest: Map::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data
            .get(name)
            .filter(|v| !v.is_null())
            .or_else(|| self.rest.get(name).filter(|v| !v.is_null()))
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    fn int_field(&self, name: &str) -> Option<i32> {
        let value = self.field(name)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.round() as i64))
            .map(|v| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
    }

    fn bool_field(&self, name: &str) -> Option<bool> {
        self.field(name).and_then(Value::as_bool)
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCommand {
    SwitchSource(String),
    GetStatus,
    ToggleService { service_id: String, enable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    GetStatus,
    DisconnectDevice(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeCommand {
    GetVolume,
    SetVolume(i32),
    AdjustVolume(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCommand {
    GetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotifyCommand {
    GetStatus,
    GetPlaybackStatus,
    Player(PlayerAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Audio(AudioCommand),
    Bluetooth(BluetoothCommand),
    Volume(VolumeCommand),
    Snapcast(DaemonCommand),
    Spotify(SpotifyCommand),
}

/// Outcome of decoding one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Command(Command),
    /// Liveness reply or unknown type
    Ignored,
    /// Known type with missing or invalid fields
    Malformed(String),
}

impl Command {
    pub fn decode(service: ServiceName, payload: &InboundPayload) -> Decoded {
        if payload.kind == "pong" {
            return Decoded::Ignored;
        }

        let missing = |field: &str| {
            Decoded::Malformed(format!("{} on {} requires '{}'", payload.kind, service, field))
        };

        let command = match (service, payload.kind.as_str()) {
            (ServiceName::Audio, "switch_source") => match payload.str_field("source") {
                Some(source) => Command::Audio(AudioCommand::SwitchSource(source.to_string())),
                None => return missing("source"),
            },
            (ServiceName::Audio, "get_status") => Command::Audio(AudioCommand::GetStatus),
            (ServiceName::Audio, "toggle_service") => {
                let Some(service_id) = payload.str_field("service_id") else {
                    return missing("service_id");
                };
                let Some(enable) = payload.bool_field("enabled") else {
                    return missing("enabled");
                };
                Command::Audio(AudioCommand::ToggleService {
                    service_id: service_id.to_string(),
                    enable,
                })
            }
            (ServiceName::Bluetooth, "get_status") => {
                Command::Bluetooth(BluetoothCommand::GetStatus)
            }
            (ServiceName::Bluetooth, "disconnect_device") => match payload.str_field("address") {
                Some(address) => {
                    Command::Bluetooth(BluetoothCommand::DisconnectDevice(address.to_string()))
                }
                None => return missing("address"),
            },
            (ServiceName::Volume, "get_volume") => Command::Volume(VolumeCommand::GetVolume),
            (ServiceName::Volume, "set_volume") => match payload.int_field("volume") {
                Some(volume) => Command::Volume(VolumeCommand::SetVolume(volume)),
                None => return missing("volume"),
            },
            (ServiceName::Volume, "adjust_volume") => match payload.int_field("delta") {
                Some(delta) => Command::Volume(VolumeCommand::AdjustVolume(delta)),
                None => return missing("delta"),
            },
            (ServiceName::Snapcast, "get_status") => Command::Snapcast(DaemonCommand::GetStatus),
            (ServiceName::Spotify, "get_status") => Command::Spotify(SpotifyCommand::GetStatus),
            (ServiceName::Spotify, "get_playback_status") => {
                Command::Spotify(SpotifyCommand::GetPlaybackStatus)
            }
            (ServiceName::Spotify, "play_pause") => {
                Command::Spotify(SpotifyCommand::Player(PlayerAction::PlayPause))
            }
            (ServiceName::Spotify, "next_track") => {
                Command::Spotify(SpotifyCommand::Player(PlayerAction::Next))
            }
            (ServiceName::Spotify, "previous_track") => {
                Command::Spotify(SpotifyCommand::Player(PlayerAction::Previous))
            }
            (service, kind) => {
                debug!("Ignoring unknown message type {:?} on {}", kind, service);
                return Decoded::Ignored;
            }
        };
        Decoded::Command(command)
    }
}

// =============================================================================
// Hub status
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub arbitration: ArbitrationState,
    pub presence: Option<DevicePresenceState>,
    pub sources: Vec<String>,
    pub topics: BTreeMap<String, usize>,
}

// =============================================================================
// ServiceRouter
// =============================================================================

/// Dispatches decoded commands to the hub's components
pub struct ServiceRouter {
    hub: Arc<BroadcastHub>,
    arbiter: Arc<SourceArbiter>,
    services: Arc<ServiceRegistry>,
    presence: Option<Arc<PresenceTracker>>,
    volume: Option<Arc<VolumeService>>,
    spotify: Option<Arc<SpotifyPoller>>,
    snapcast: Option<Arc<SnapcastMonitor>>,
}

impl ServiceRouter {
    pub fn new(hub: Arc<BroadcastHub>, arbiter: Arc<SourceArbiter>) -> Self {
        Self {
            hub,
            arbiter,
            services: Arc::new(ServiceRegistry::new()),
            presence: None,
            volume: None,
            spotify: None,
            snapcast: None,
        }
    }

    pub fn with_services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = services;
        self
    }

    pub fn with_presence(mut self, presence: Arc<PresenceTracker>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_volume(mut self, volume: Arc<VolumeService>) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_spotify(mut self, spotify: Arc<SpotifyPoller>) -> Self {
        self.spotify = Some(spotify);
        self
    }

    pub fn with_snapcast(mut self, snapcast: Arc<SnapcastMonitor>) -> Self {
        self.snapcast = Some(snapcast);
        self
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn arbiter(&self) -> &Arc<SourceArbiter> {
        &self.arbiter
    }

    /// Which optional services are wired up
    pub fn available_services(&self) -> BTreeMap<&'static str, bool> {
        BTreeMap::from([
            (ServiceName::Audio.as_str(), true),
            (ServiceName::Bluetooth.as_str(), self.presence.is_some()),
            (ServiceName::Volume.as_str(), self.volume.is_some()),
            (ServiceName::Snapcast.as_str(), self.snapcast.is_some()),
            (ServiceName::Spotify.as_str(), self.spotify.is_some()),
        ])
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            arbitration: self.arbiter.current_state(),
            presence: self.presence.as_ref().map(|p| p.state()),
            sources: self.arbiter.registry().ids(),
            topics: self.hub.observer_counts(),
        }
    }

    /// Parse raw text from a connection and handle it
    pub async fn handle_text(&self, service: &str, text: &str) -> Option<Envelope> {
        match serde_json::from_str::<InboundPayload>(text) {
            Ok(payload) => self.handle_message(service, payload).await,
            Err(e) => {
                warn!("Malformed message on {}: {}", service, e);
                Some(Envelope::error(service, format!("invalid message: {}", e)))
            }
        }
    }

    /// Handle one payload. Returns a reply meant only for the sender
    /// (`error` or `busy`); state changes are published through the hub.
    pub async fn handle_message(&self, service: &str, payload: InboundPayload) -> Option<Envelope> {
        let mut service_name = match service.parse::<ServiceName>() {
            Ok(name) => name,
            Err(e) => {
                warn!("{}", e);
                return Some(Envelope::error(service, e.to_string()));
            }
        };

        let mut payload = payload;
        if service_name == ServiceName::Global {
            match unwrap_global(payload) {
                Ok(Some((target, inner))) => {
                    service_name = target;
                    payload = inner;
                }
                Ok(None) => return None,
                Err(reply) => return Some(reply),
            }
        }

        match Command::decode(service_name, &payload) {
            Decoded::Command(command) => self.dispatch(command).await,
            Decoded::Ignored => None,
            Decoded::Malformed(message) => {
                warn!("{}", message);
                Some(Envelope::error(service_name.as_str(), message))
            }
        }
    }

    async fn dispatch(&self, command: Command) -> Option<Envelope> {
        debug!("Dispatching {:?}", command);
        match command {
            Command::Audio(command) => self.dispatch_audio(command).await,
            Command::Bluetooth(command) => {
                let Some(presence) = &self.presence else {
                    return Some(unavailable(ServiceName::Bluetooth));
                };
                match command {
                    BluetoothCommand::GetStatus => {
                        presence.reconcile().await;
                        None
                    }
                    BluetoothCommand::DisconnectDevice(address) => presence
                        .disconnect_device(&address)
                        .await
                        .err()
                        .map(|e| Envelope::error(ServiceName::Bluetooth.as_str(), e.to_string())),
                }
            }
            Command::Volume(command) => {
                let Some(volume) = &self.volume else {
                    return Some(unavailable(ServiceName::Volume));
                };
                let result = match command {
                    VolumeCommand::GetVolume => volume.get_volume().await.map(|_| true),
                    VolumeCommand::SetVolume(level) => volume.set_volume(level).await,
                    VolumeCommand::AdjustVolume(delta) => volume.adjust_volume(delta).await,
                };
                result
                    .err()
                    .map(|e| Envelope::error(ServiceName::Volume.as_str(), e.to_string()))
            }
            Command::Spotify(command) => {
                let Some(spotify) = &self.spotify else {
                    return Some(unavailable(ServiceName::Spotify));
                };
                let result = match command {
                    SpotifyCommand::GetStatus | SpotifyCommand::GetPlaybackStatus => {
                        spotify.refresh().await
                    }
                    SpotifyCommand::Player(action) => spotify.control(action).await,
                };
                result
                    .err()
                    .map(|e| Envelope::error(ServiceName::Spotify.as_str(), e.to_string()))
            }
            Command::Snapcast(DaemonCommand::GetStatus) => {
                let Some(snapcast) = &self.snapcast else {
                    return Some(unavailable(ServiceName::Snapcast));
                };
                snapcast.refresh().await;
                None
            }
        }
    }

    async fn dispatch_audio(&self, command: AudioCommand) -> Option<Envelope> {
        let service = ServiceName::Audio.as_str();
        match command {
            AudioCommand::SwitchSource(source) => match self.arbiter.switch_to(&source).await {
                Ok(true) => None,
                Ok(false) => {
                    info!("Switch to {} rejected: busy", source);
                    Some(Envelope::new(
                        "busy",
                        json!({
                            "service": service,
                            "error": HubError::Conflict.to_string(),
                            "requested_source": source,
                        }),
                    ))
                }
                Err(e) => Some(Envelope::error(service, e.to_string())),
            },
            AudioCommand::GetStatus => {
                let state = self.arbiter.current_state();
                self.hub.publish(
                    &Topic::new(AUDIO_TOPIC),
                    Envelope::new(
                        "state",
                        json!({
                            "current_source": state.current_source,
                            "is_switching": state.switch_in_progress,
                        }),
                    ),
                );
                None
            }
            AudioCommand::ToggleService { service_id, enable } => self
                .services
                .toggle(&service_id, enable)
                .await
                .err()
                .map(|e| Envelope::error(service, e.to_string())),
        }
    }
}

/// Global connections send `{ service, message }`. Returns the target and
/// inner payload, `None` for liveness replies and unwrapped messages, or an
/// error reply for the sender.
fn unwrap_global(
    payload: InboundPayload,
) -> Result<Option<(ServiceName, InboundPayload)>, Envelope> {
    let global = ServiceName::Global.as_str();
    if payload.kind == "pong" {
        return Ok(None);
    }
    let Some(target) = payload.str_field("service") else {
        debug!("Ignoring unwrapped {:?} on global", payload.kind);
        return Ok(None);
    };
    let target = match target.parse::<ServiceName>() {
        Ok(ServiceName::Global) => {
            return Err(Envelope::error(global, "wrapped request cannot target global"))
        }
        Ok(name) => name,
        Err(e) => return Err(Envelope::error(target, e.to_string())),
    };
    let Some(message) = payload.field("message").cloned() else {
        return Err(Envelope::error(global, "wrapped request requires 'message'"));
    };
    match serde_json::from_value::<InboundPayload>(message) {
        Ok(inner) => Ok(Some((target, inner))),
        Err(e) => Err(Envelope::error(
            target.as_str(),
            format!("invalid message: {}", e),
        )),
    }
}

fn unavailable(service: ServiceName) -> Envelope {
    Envelope::error(
        service.as_str(),
        HubError::not_found("service", service.as_str()).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> InboundPayload {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_service_name_parsing() {
        assert_eq!("audio".parse::<ServiceName>(), Ok(ServiceName::Audio));
        assert_eq!("global".parse::<ServiceName>(), Ok(ServiceName::Global));
        assert_eq!(
            "radio".parse::<ServiceName>(),
            Err(HubError::not_found("service", "radio"))
        );
    }

    #[test]
    fn test_decode_switch_source() {
        let decoded = Command::decode(
            ServiceName::Audio,
            &payload(r#"{"type": "switch_source", "data": {"source": "spotify"}}"#),
        );
        assert_eq!(
            decoded,
            Decoded::Command(Command::Audio(AudioCommand::SwitchSource(
                "spotify".to_string()
            )))
        );
    }

    #[test]
    fn test_decode_reads_top_level_fields() {
        let decoded = Command::decode(
            ServiceName::Volume,
            &payload(r#"{"type": "set_volume", "volume": 42}"#),
        );
        assert_eq!(
            decoded,
            Decoded::Command(Command::Volume(VolumeCommand::SetVolume(42)))
        );

        let decoded = Command::decode(
            ServiceName::Volume,
            &payload(r#"{"type": "adjust_volume", "data": {"delta": -1.0}}"#),
        );
        assert_eq!(
            decoded,
            Decoded::Command(Command::Volume(VolumeCommand::AdjustVolume(-1)))
        );
    }

    #[test]
    fn test_decode_unknown_and_pong_are_ignored() {
        assert_eq!(
            Command::decode(ServiceName::Audio, &payload(r#"{"type": "rewind"}"#)),
            Decoded::Ignored
        );
        assert_eq!(
            Command::decode(ServiceName::Spotify, &payload(r#"{"type": "pong"}"#)),
            Decoded::Ignored
        );
        // Known type on the wrong service
        assert_eq!(
            Command::decode(ServiceName::Snapcast, &payload(r#"{"type": "set_volume"}"#)),
            Decoded::Ignored
        );
    }

    #[test]
    fn test_decode_missing_field_is_malformed() {
        assert!(matches!(
            Command::decode(ServiceName::Audio, &payload(r#"{"type": "switch_source"}"#)),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            Command::decode(
                ServiceName::Bluetooth,
                &payload(r#"{"type": "disconnect_device", "data": {}}"#)
            ),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn test_decode_spotify_transport_commands() {
        let decode = |kind: &str| {
            Command::decode(
                ServiceName::Spotify,
                &payload(&format!(r#"{{"type": "{}"}}"#, kind)),
            )
        };
        assert_eq!(
            decode("play_pause"),
            Decoded::Command(Command::Spotify(SpotifyCommand::Player(PlayerAction::PlayPause)))
        );
        assert_eq!(
            decode("next_track"),
            Decoded::Command(Command::Spotify(SpotifyCommand::Player(PlayerAction::Next)))
        );
        assert_eq!(
            decode("previous_track"),
            Decoded::Command(Command::Spotify(SpotifyCommand::Player(PlayerAction::Previous)))
        );
        assert_eq!(
            decode("get_playback_status"),
            Decoded::Command(Command::Spotify(SpotifyCommand::GetPlaybackStatus))
        );
        // Transport commands belong to spotify only
        assert_eq!(
            Command::decode(ServiceName::Snapcast, &payload(r#"{"type": "next_track"}"#)),
            Decoded::Ignored
        );
    }

    #[test]
    fn test_unwrap_global() {
        let wrapped = payload(
            r#"{"type": "request", "service": "volume", "message": {"type": "set_volume", "data": {"volume": 10}}}"#,
        );
        let (target, inner) = unwrap_global(wrapped).unwrap().unwrap();
        assert_eq!(target, ServiceName::Volume);
        assert_eq!(inner.kind, "set_volume");

        assert_eq!(unwrap_global(payload(r#"{"type": "pong"}"#)), Ok(None));
        assert!(unwrap_global(payload(r#"{"type": "x", "service": "radio", "message": {}}"#)).is_err());
        assert!(unwrap_global(payload(r#"{"type": "x", "service": "audio"}"#)).is_err());
    }

    #[test]
    fn test_decode_toggle_service() {
        let decoded = Command::decode(
            ServiceName::Audio,
            &payload(r#"{"type": "toggle_service", "data": {"service_id": "volume", "enabled": false}}"#),
        );
        assert_eq!(
            decoded,
            Decoded::Command(Command::Audio(AudioCommand::ToggleService {
                service_id: "volume".to_string(),
                enable: false,
            }))
        );
    }
}
