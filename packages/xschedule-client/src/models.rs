//! Wire models for xSchedule API responses
//!
//! The device serializes every scalar as a string, including booleans and
//! millisecond durations. The models keep the raw strings and convert in
//! accessors with a zero fallback, so unexpected values never fail a whole
//! listing. Unknown response fields are ignored for forward compatibility.

use serde::{Deserialize, Serialize};

/// A single step (song) in a playlist listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistStep {
    /// Step name as shown in the sequencer
    #[serde(default)]
    pub name: String,

    /// Device-assigned step identifier
    #[serde(default)]
    pub id: String,

    /// Step duration in milliseconds, as reported (string on the wire)
    #[serde(default, rename = "lengthms")]
    pub length_ms: String,
}

impl PlaylistStep {
    /// Step duration in milliseconds, 0 when the device reports garbage
    pub fn duration_ms(&self) -> u64 {
        parse_device_number(&self.length_ms)
    }
}

/// Schedule information for a playlist
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    /// Schedule name
    #[serde(default)]
    pub name: String,

    /// Device-assigned schedule identifier
    #[serde(default)]
    pub id: String,

    /// Whether the schedule is enabled ("true"/"false" on the wire)
    #[serde(default)]
    pub enabled: String,

    /// Whether the schedule is currently active ("true"/"false" on the wire)
    #[serde(default)]
    pub active: String,

    /// Scheduled start, as reported by the device
    #[serde(default)]
    pub start: String,

    /// Scheduled end, as reported by the device
    #[serde(default)]
    pub end: String,
}

impl ScheduleInfo {
    /// Whether the schedule is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled == "true"
    }

    /// Whether the schedule is currently active
    pub fn is_active(&self) -> bool {
        self.active == "true"
    }
}

/// Parse one of the device's stringly-typed numbers, falling back to 0
pub(crate) fn parse_device_number(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_duration_parses_string_millis() {
        let step = PlaylistStep {
            name: "Light Em Up".to_string(),
            id: "3".to_string(),
            length_ms: "185750".to_string(),
        };
        assert_eq!(step.duration_ms(), 185_750);
    }

    #[test]
    fn test_step_duration_garbage_falls_back_to_zero() {
        for raw in ["", "n/a", "-5", "12.5"] {
            let step = PlaylistStep {
                length_ms: raw.to_string(),
                ..Default::default()
            };
            assert_eq!(step.duration_ms(), 0, "raw {raw:?}");
        }
    }

    #[test]
    fn test_step_deserializes_with_missing_and_unknown_fields() {
        let step: PlaylistStep = serde_json::from_value(serde_json::json!({
            "name": "Intro",
            "somefuturefield": "whatever"
        }))
        .expect("should deserialize");

        assert_eq!(step.name, "Intro");
        assert_eq!(step.id, "");
        assert_eq!(step.duration_ms(), 0);
    }

    #[test]
    fn test_schedule_flags() {
        let schedule: ScheduleInfo = serde_json::from_value(serde_json::json!({
            "name": "Nightly",
            "enabled": "true",
            "active": "false"
        }))
        .expect("should deserialize");

        assert!(schedule.is_enabled());
        assert!(!schedule.is_active());
    }
}
