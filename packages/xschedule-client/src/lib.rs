//! xSchedule HTTP API client
//!
//! This crate provides a typed client for the query/command HTTP API of the
//! xSchedule lighting sequencer, covering:
//! - Playback status and playlist/step/schedule queries
//! - Playback, volume and queue commands
//! - Read-through TTL caching of the slow-changing listings
//!
//! # Example
//!
//! ```rust,no_run
//! use xschedule_client::XScheduleClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = XScheduleClient::new("192.168.1.50", 80, None)?;
//!
//! let status = client.playing_status().await?;
//! println!("{status}");
//!
//! let steps = client.playlist_steps("Halloween", false).await?;
//! for step in steps {
//!     println!("{}: {}ms", step.name, step.duration_ms());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Wire quirks
//!
//! The device percent-decodes query parameters but does not understand `+`
//! as a space, so parameters are encoded with `%20`. All scalar fields in
//! responses are strings (including booleans and millisecond durations);
//! the models keep them as strings and expose defensive accessors.

mod cache;
mod client;
mod error;
mod models;

pub use client::{hash_credential, is_playback_affecting, XScheduleClient};
pub use error::{DeviceError, DeviceResult};
pub use models::{PlaylistStep, ScheduleInfo};
