//! Audio Hub
//!
//! Source arbitration and state synchronization for a multi-source home
//! audio device.
//!
//! This library provides:
//! - Exclusive arbitration between script-driven audio sources
//! - Topic-scoped broadcast to connected UI clients
//! - Bluetooth device presence tracking
//! - Volume with a display-to-hardware curve
//! - Status polling for the Spotify Connect daemon and snapserver

pub mod api;
pub mod arbiter;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod daemons;
pub mod error;
pub mod notifier;
pub mod presence;
pub mod router;
pub mod sources;
pub mod volume;
