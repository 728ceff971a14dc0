//! Real-time synchronization engine for the xSchedule lighting sequencer
//!
//! This crate keeps a local view of an xSchedule device's playback state
//! consistent with reality over an unreliable, partial, push-only status
//! feed, and layers a client-side "play next" priority queue on top of the
//! device's plain FIFO queue.
//!
//! The moving parts:
//! - A push channel ([`ChannelState`]) that owns the WebSocket to the
//!   device, reconnecting with exponential backoff and polling for status
//!   during quiet periods.
//! - A status synchronizer that reconciles sparse payloads into a canonical
//!   [`PlaybackStatus`], detects meaningful transitions, and drives cache
//!   invalidation and queue advancement.
//! - A debounced update scheduler that coalesces bursts of payload-driven
//!   mutations into a single externally visible notification.
//! - A priority queue whose head is kept synchronized with the device via
//!   "jump to step at end of current step" commands.
//!
//! All of it is owned by a single [`Player`] per configured device.
//!
//! # Example
//!
//! ```rust,no_run
//! use xschedule_engine::{DeviceConfig, Player, PlayerEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let player = Player::new(DeviceConfig::new("192.168.1.50", 80))?;
//! let mut events = player.subscribe();
//!
//! player.connect().await;
//!
//! while let Ok(event) = events.recv().await {
//!     if let PlayerEvent::StatusChanged(status) = event {
//!         println!("{:?}: {:?}", status.state, status.step_name);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod debounce;
mod error;
mod player;
mod protocol;
mod queue;
mod state;
mod sync;

pub use channel::{ChannelSendError, ChannelState};
pub use config::DeviceConfig;
pub use error::PlayerError;
pub use player::{Player, PlayerEvent};
pub use queue::QueueItem;
pub use state::{CacheTransition, ControllerHealth, PlaybackState, PlaybackStatus};

pub use xschedule_client::{DeviceError, PlaylistStep, ScheduleInfo};
