//! Canonical playback state
//!
//! `PlaybackStatus` is owned exclusively by the status synchronizer and
//! replaced field-by-field from incoming payloads. Invariant: when `state`
//! is `Idle`, all playback-position fields are `None`, so a consumer never
//! sees a stale song name on a stopped player.

use serde::Serialize;
use serde_json::Value;

/// High-level playback state derived from the device's `status` field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    /// Nothing is playing
    #[default]
    Idle,
    /// A step is playing
    Playing,
    /// Playback is paused
    Paused,
    /// The device is unreachable
    Offline,
}

/// Health of one output controller, from the device's ping status list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerHealth {
    /// Controller name
    pub name: String,

    /// Controller network address
    pub address: String,

    /// Whether the last ping succeeded
    pub healthy: bool,

    /// Consecutive ping failures reported by the device
    pub failure_count: u32,
}

impl ControllerHealth {
    /// Parse one `pingstatus` entry; missing fields degrade to defaults so
    /// a partial entry never drops the whole list
    pub(crate) fn from_payload(entry: &Value) -> Self {
        let failure_count = match entry.get("failcount") {
            Some(Value::String(raw)) => raw.trim().parse().unwrap_or(0),
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
            _ => 0,
        };

        Self {
            name: entry
                .get("controller")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            address: entry
                .get("ip")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            healthy: entry.get("result").and_then(Value::as_str) == Some("Ok"),
            failure_count,
        }
    }
}

/// Canonical view of the device's playback state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStatus {
    /// Current playback state
    pub state: PlaybackState,

    /// Playlist currently loaded, if any
    pub playlist_name: Option<String>,

    /// Step (song) currently playing, if any
    pub step_name: Option<String>,

    /// Position within the current step, in milliseconds
    pub position_ms: Option<u64>,

    /// Length of the current step, in milliseconds
    pub length_ms: Option<u64>,

    /// Time remaining in the current step, in milliseconds
    pub remaining_ms: Option<u64>,

    /// Output volume, 0-100
    pub volume_percent: Option<u8>,

    /// Locally tracked mute state (the device only exposes a toggle)
    pub muted: bool,

    /// Controller health, in the order the device reports it
    pub controllers: Vec<ControllerHealth>,
}

impl PlaybackStatus {
    /// Clear every playback-position field (the Idle invariant)
    pub(crate) fn clear_position_fields(&mut self) {
        self.playlist_name = None;
        self.step_name = None;
        self.position_ms = None;
        self.length_ms = None;
        self.remaining_ms = None;
    }
}

/// Before/after snapshot attached to cache-invalidation notifications for
/// observability
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheTransition {
    pub old_state: PlaybackState,
    pub new_state: PlaybackState,
    pub old_playlist: Option<String>,
    pub new_playlist: Option<String>,
}
