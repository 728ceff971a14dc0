//! Status synchronizer
//!
//! The single authority converting heterogeneous device payloads, pushed
//! over the channel or fetched by a fallback poll, into the canonical
//! [`PlaybackStatus`]. Payloads are sparse: a field absent from a payload
//! keeps its previous value, except that an idle payload unconditionally
//! clears the playback-position fields so stale song data can never be
//! shown on a stopped player.
//!
//! `apply` is a pure state transition returning a [`PayloadEffects`]; the
//! player turns those effects into cache invalidation, step refetches,
//! queue advancement and the debounced update notification. Keeping the
//! side effects out of this module makes every reconciliation rule
//! testable on raw JSON.

use serde_json::Value;
use tracing::debug;
use xschedule_client::PlaylistStep;

use crate::state::{CacheTransition, ControllerHealth, PlaybackState, PlaybackStatus};

/// Side effects requested by one payload application
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PayloadEffects {
    /// The state or playlist changed: invalidate the gateway cache and
    /// notify observers with this before/after snapshot
    pub cache_transition: Option<CacheTransition>,

    /// The playlist changed to this value: refetch its step listing so
    /// dependent views are not left blank
    pub playlist_changed_to: Option<String>,

    /// The controller-health list changed structurally: the new list
    pub controllers_changed: Option<Vec<ControllerHealth>>,

    /// A new step started playing (suppressed for the very first payload)
    pub song_started: Option<String>,
}

/// Owned playback state plus the listings the payloads can clear
#[derive(Debug, Default)]
pub(crate) struct StatusSynchronizer {
    status: PlaybackStatus,
    playlist_steps: Vec<PlaylistStep>,
    queued_steps: Vec<PlaylistStep>,
    /// False until the first payload has been applied; the first observed
    /// step is not a "song started" event
    seen_payload: bool,
}

impl StatusSynchronizer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn status(&self) -> &PlaybackStatus {
        &self.status
    }

    pub(crate) fn playlist_steps(&self) -> &[PlaylistStep] {
        &self.playlist_steps
    }

    pub(crate) fn queued_steps(&self) -> &[PlaylistStep] {
        &self.queued_steps
    }

    pub(crate) fn set_playlist_steps(&mut self, steps: Vec<PlaylistStep>) {
        self.playlist_steps = steps;
    }

    pub(crate) fn set_queued_steps(&mut self, steps: Vec<PlaylistStep>) {
        self.queued_steps = steps;
    }

    pub(crate) fn set_muted(&mut self, muted: bool) {
        self.status.muted = muted;
    }

    /// The fallback poll failed: the device is unreachable
    pub(crate) fn mark_offline(&mut self) {
        self.status.state = PlaybackState::Offline;
    }

    /// Reconcile one payload into the canonical state
    pub(crate) fn apply(&mut self, payload: &Value) -> PayloadEffects {
        let mut effects = PayloadEffects::default();

        let old_state = self.status.state;
        let old_playlist = self.status.playlist_name.clone();
        let old_step = self.status.step_name.clone();

        self.status.state = derive_state(payload);

        if self.status.state == PlaybackState::Idle {
            self.status.clear_position_fields();

            // A momentary gap between songs must not wipe the visible song
            // list; only a genuine stop (no playlist, lights off) may
            let output_to_lights = payload
                .get("outputtolights")
                .and_then(Value::as_str)
                .unwrap_or("false");
            if payload.get("playlist").is_none() && output_to_lights == "false" {
                self.playlist_steps.clear();
                self.queued_steps.clear();
            }
        } else {
            // Present fields overwrite, absent fields retain; null means
            // "present but empty"
            if let Some(value) = payload.get("playlist") {
                self.status.playlist_name = optional_string(value);
            }
            if let Some(value) = payload.get("step") {
                self.status.step_name = optional_string(value);
            }
            if let Some(value) = payload.get("positionms") {
                self.status.position_ms = Some(parse_ms(value));
            }
            if let Some(value) = payload.get("lengthms") {
                self.status.length_ms = Some(parse_ms(value));
            }
            if let Some(value) = payload.get("leftms") {
                self.status.remaining_ms = Some(parse_ms(value));
            }
            if let Some(value) = payload.get("volume") {
                self.status.volume_percent = parse_volume(value);
            }
        }

        if let Some(Value::Array(entries)) = payload.get("pingstatus") {
            let controllers: Vec<ControllerHealth> =
                entries.iter().map(ControllerHealth::from_payload).collect();
            // Full ordered-list comparison; unchanged heartbeats must not
            // flood observers
            if controllers != self.status.controllers {
                self.status.controllers = controllers.clone();
                effects.controllers_changed = Some(controllers);
            }
        }

        if old_state != self.status.state || old_playlist != self.status.playlist_name {
            debug!(
                ?old_state,
                new_state = ?self.status.state,
                ?old_playlist,
                new_playlist = ?self.status.playlist_name,
                "playback transition"
            );

            if old_playlist != self.status.playlist_name {
                self.playlist_steps.clear();
                effects.playlist_changed_to = self.status.playlist_name.clone();
            }

            effects.cache_transition = Some(CacheTransition {
                old_state,
                new_state: self.status.state,
                old_playlist,
                new_playlist: self.status.playlist_name.clone(),
            });
        }

        if self.seen_payload {
            if let Some(step) = self.status.step_name.as_deref() {
                if !step.is_empty() && old_step.as_deref() != Some(step) {
                    effects.song_started = Some(step.to_string());
                }
            }
        }
        self.seen_payload = true;

        effects
    }
}

/// Derive the playback state from a `status` field, case-insensitively;
/// anything unrecognized (or absent) is idle
fn derive_state(payload: &Value) -> PlaybackState {
    match payload
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("playing") => PlaybackState::Playing,
        Some("paused") => PlaybackState::Paused,
        _ => PlaybackState::Idle,
    }
}

/// A string field that may be null ("present but empty")
fn optional_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Millisecond fields arrive as strings (sometimes numbers); anything
/// unparseable is 0, never an error
fn parse_ms(value: &Value) -> u64 {
    match value {
        Value::String(raw) => raw.trim().parse().unwrap_or(0),
        Value::Number(n) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

/// Volume is optional; garbage clears it rather than inventing a level
fn parse_volume(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::String(raw) => raw.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Some(raw.clamp(0, 100) as u8)
}
