//! Player facade
//!
//! One `Player` owns everything for one configured device: the HTTP
//! gateway, the push channel, the canonical playback state, the client-side
//! priority queue and the debounced update scheduler. All state lives
//! behind a single mutex, so payload handling and external calls share one
//! sequential timeline: no two payload applications ever race, and cache
//! invalidation is ordered before any read that could observe stale data.
//!
//! The channel's connect loop, heartbeat and reader run concurrently with
//! each other but only ever enqueue payloads toward this module; they never
//! touch state directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use xschedule_client::{is_playback_affecting, PlaylistStep, ScheduleInfo, XScheduleClient};

use crate::channel::{ChannelSendError, ChannelState, PushChannel};
use crate::config::DeviceConfig;
use crate::debounce::UpdateScheduler;
use crate::error::PlayerError;
use crate::queue::{PlayQueue, QueueItem, SongStartOutcome};
use crate::state::{CacheTransition, ControllerHealth, PlaybackStatus};
use crate::sync::StatusSynchronizer;

/// Capacity of the payload pipe from the push channel
const PAYLOAD_BUFFER: usize = 64;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 64;

/// Device command that redirects playback to a step when the current one ends
const JUMP_COMMAND: &str =
    "Jump to specified step in current playlist at the end of current step";

/// Notifications emitted by the player
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// The canonical state changed. Debounced: a burst of raw payloads
    /// yields one of these per quiescence window.
    StatusChanged(PlaybackStatus),

    /// The controller-health list changed structurally
    ControllerHealthChanged(Vec<ControllerHealth>),

    /// A playback transition invalidated the listing cache; carries the
    /// before/after snapshot for diagnostics
    CacheInvalidated(CacheTransition),
}

/// State owned by the single sequential timeline
struct PlayerCore {
    sync: StatusSynchronizer,
    queue: PlayQueue,
    scheduler: UpdateScheduler,
    playlists: Vec<String>,
}

struct PlayerShared {
    gateway: XScheduleClient,
    channel: PushChannel,
    core: Mutex<PlayerCore>,
    events: broadcast::Sender<PlayerEvent>,
    closed: AtomicBool,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to one device's synchronization engine
pub struct Player {
    shared: Arc<PlayerShared>,
}

impl Player {
    /// Build the engine for one device. Must be called within a tokio
    /// runtime; nothing touches the network until [`connect`](Self::connect).
    pub fn new(config: DeviceConfig) -> Result<Self, PlayerError> {
        let gateway =
            XScheduleClient::new(&config.host, config.port, config.password.as_deref())?;

        let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_BUFFER);
        let channel = PushChannel::new(&config, payload_tx);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(PlayerShared {
            gateway,
            channel,
            core: Mutex::new(PlayerCore {
                sync: StatusSynchronizer::new(),
                queue: PlayQueue::default(),
                scheduler: UpdateScheduler::new(config.update_debounce),
                playlists: Vec::new(),
            }),
            events,
            closed: AtomicBool::new(false),
            pump: StdMutex::new(None),
        });

        let pump = tokio::spawn(pump_payloads(Arc::downgrade(&shared), payload_rx));
        *shared
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pump);

        Ok(Self { shared })
    }

    /// Start the push channel and seed state with a first poll
    pub async fn connect(&self) {
        self.shared.channel.connect().await;
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "initial status fetch failed");
        }
    }

    /// Tear down: stops the push channel (and waits for it), the payload
    /// pump and any pending debounced emission. No notification fires
    /// after this returns.
    pub async fn shutdown(&self) {
        info!("shutting down player");
        self.shared.closed.store(true, Ordering::SeqCst);

        self.shared.channel.disconnect().await;

        let pump = self
            .shared
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        let mut core = self.shared.core.lock().await;
        core.scheduler.cancel().await;
    }

    /// Fallback poll path, also used to backfill listings.
    ///
    /// When the push channel is down the device is polled for status (a
    /// failure marks the player `Offline`). Regardless of the channel, the
    /// playlist index, the active playlist's steps and the device-side
    /// queue are fetched if missing; the push feed never carries them.
    pub async fn refresh(&self) -> Result<(), PlayerError> {
        let shared = &self.shared;

        if shared.channel.is_connected() {
            // Nudge the device over the socket; the reply arrives as a
            // pushed payload like any other
            if let Err(e) = shared.channel.send_query("GetPlayingStatus", "").await {
                debug!(error = %e, "channel query refused, next poll covers it");
            }
        } else {
            match shared.gateway.playing_status().await {
                Ok(status) => shared.handle_payload(status).await,
                Err(e) => {
                    warn!(error = %e, "status poll failed, marking device offline");
                    let mut core = shared.core.lock().await;
                    core.sync.mark_offline();
                    shared.schedule_status_update(&mut core);
                    return Err(e.into());
                }
            }
        }

        let need_playlists = shared.core.lock().await.playlists.is_empty();
        if need_playlists {
            let playlists = shared.gateway.playlists(false).await?;
            shared.core.lock().await.playlists = playlists;
        }

        let missing_steps = {
            let core = shared.core.lock().await;
            match core.sync.status().playlist_name.clone() {
                Some(playlist) if core.sync.playlist_steps().is_empty() => Some(playlist),
                _ => None,
            }
        };
        if let Some(playlist) = missing_steps {
            let steps = shared.gateway.playlist_steps(&playlist, false).await?;
            shared.core.lock().await.sync.set_playlist_steps(steps);
        }

        let need_device_queue = {
            let core = shared.core.lock().await;
            core.sync.queued_steps().is_empty() || !shared.channel.is_connected()
        };
        if need_device_queue {
            let queued = shared.gateway.queued_steps().await?;
            shared.core.lock().await.sync.set_queued_steps(queued);
        }

        Ok(())
    }

    // Observation

    /// Current canonical playback state
    pub async fn status(&self) -> PlaybackStatus {
        self.shared.core.lock().await.sync.status().clone()
    }

    /// Current play-next queue, head first
    pub async fn queue_snapshot(&self) -> Vec<QueueItem> {
        self.shared.core.lock().await.queue.items().to_vec()
    }

    /// Names of the playlists available on the device
    pub async fn playlists(&self) -> Vec<String> {
        self.shared.core.lock().await.playlists.clone()
    }

    /// Steps of the active playlist, as currently tracked
    pub async fn playlist_steps(&self) -> Vec<PlaylistStep> {
        self.shared.core.lock().await.sync.playlist_steps().to_vec()
    }

    /// Device-side FIFO queue, as last fetched
    pub async fn device_queue(&self) -> Vec<PlaylistStep> {
        self.shared.core.lock().await.sync.queued_steps().to_vec()
    }

    /// Schedules for a playlist (cached in the gateway)
    pub async fn playlist_schedules(
        &self,
        playlist: &str,
        force_refresh: bool,
    ) -> Result<Vec<ScheduleInfo>, PlayerError> {
        Ok(self
            .shared
            .gateway
            .playlist_schedules(playlist, force_refresh)
            .await?)
    }

    /// Subscribe to player notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    /// Current push-channel state
    pub fn channel_state(&self) -> ChannelState {
        self.shared.channel.state()
    }

    // Play-next queue

    /// Queue a song from the active playlist, or bump its priority if it
    /// is already queued.
    ///
    /// When the song ends up at the queue head a jump command is issued
    /// immediately. A failed jump does not roll the queue back; the item
    /// stays queued for a manual retry and the error is returned.
    pub async fn enqueue(&self, song_name: &str) -> Result<Uuid, PlayerError> {
        let shared = &self.shared;

        let (playlist, cached_steps) = {
            let core = shared.core.lock().await;
            let playlist = core
                .sync
                .status()
                .playlist_name
                .clone()
                .ok_or(PlayerError::NoActivePlaylist)?;
            (playlist, core.sync.playlist_steps().to_vec())
        };

        let steps = if cached_steps.is_empty() {
            let steps = shared.gateway.playlist_steps(&playlist, false).await?;
            shared
                .core
                .lock()
                .await
                .sync
                .set_playlist_steps(steps.clone());
            steps
        } else {
            cached_steps
        };

        let step = steps
            .iter()
            .find(|s| s.name == song_name)
            .ok_or_else(|| PlayerError::SongNotInPlaylist {
                song: song_name.to_string(),
                playlist: playlist.clone(),
            })?;
        let duration_ms = step.duration_ms();

        let outcome = {
            let mut core = shared.core.lock().await;
            let outcome = core.queue.add(song_name, &playlist, duration_ms);
            shared.schedule_status_update(&mut core);
            outcome
        };

        debug!(
            song = song_name,
            playlist = %playlist,
            is_head = outcome.is_head,
            "queued song"
        );

        if outcome.is_head {
            self.shared.send_jump(song_name).await?;
        }

        Ok(outcome.id)
    }

    /// Remove a queued song. Inert toward the device: the new head is not
    /// jumped to; only an explicit reorder or a song start does that.
    pub async fn remove_queued(&self, id: Uuid) -> Result<(), PlayerError> {
        let mut core = self.shared.core.lock().await;
        let removed = core.queue.remove(id)?;
        self.shared.schedule_status_update(&mut core);
        debug!(song = %removed.song_name, "removed queued song");
        Ok(())
    }

    /// Replace the queue order. `ids` must name exactly the current items.
    ///
    /// A changed head issues a jump for the new head; if that command
    /// fails the reorder is kept and the error returned, leaving the
    /// caller to retry the jump.
    pub async fn reorder_queue(&self, ids: &[Uuid]) -> Result<(), PlayerError> {
        let new_head = {
            let mut core = self.shared.core.lock().await;
            let head_changed = core.queue.reorder(ids)?;
            self.shared.schedule_status_update(&mut core);
            if head_changed {
                core.queue.head().map(|h| h.song_name.clone())
            } else {
                None
            }
        };

        if let Some(song) = new_head {
            self.shared.send_jump(&song).await?;
        }

        Ok(())
    }

    /// Empty the queue. Issues no device command.
    pub async fn clear_queue(&self) {
        let mut core = self.shared.core.lock().await;
        core.queue.clear();
        self.shared.schedule_status_update(&mut core);
    }

    // Transport and volume

    /// Resume: replays the tracked playlist when one is active, otherwise
    /// a plain resume
    pub async fn play(&self) -> Result<(), PlayerError> {
        let playlist = self.shared.core.lock().await.sync.status().playlist_name.clone();
        match playlist {
            Some(playlist) => {
                self.shared
                    .execute_command("Play specified playlist", Some(&playlist))
                    .await
            }
            None => self.shared.execute_command("Play", None).await,
        }
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.shared.execute_command("Pause", None).await
    }

    pub async fn stop(&self) -> Result<(), PlayerError> {
        self.shared.execute_command("Stop", None).await
    }

    pub async fn next_step(&self) -> Result<(), PlayerError> {
        self.shared
            .execute_command("Next step in current playlist", None)
            .await
    }

    pub async fn previous_step(&self) -> Result<(), PlayerError> {
        self.shared
            .execute_command("Prior step in current playlist", None)
            .await
    }

    pub async fn restart_step(&self) -> Result<(), PlayerError> {
        self.shared
            .execute_command("Restart step in current playlist", None)
            .await
    }

    /// Start the named playlist
    pub async fn play_playlist(&self, playlist: &str) -> Result<(), PlayerError> {
        self.shared
            .execute_command("Play specified playlist", Some(playlist))
            .await
    }

    /// Start a specific step of a playlist
    pub async fn play_step(&self, playlist: &str, step: &str) -> Result<(), PlayerError> {
        let parameters = format!("{playlist},{step}");
        self.shared
            .execute_command("Play playlist step", Some(&parameters))
            .await
    }

    /// Seek within the current step
    pub async fn seek_ms(&self, position_ms: u64) -> Result<(), PlayerError> {
        self.shared
            .execute_command("Set step position ms", Some(&position_ms.to_string()))
            .await
    }

    /// Set the output volume (0-100)
    pub async fn set_volume(&self, volume: u8) -> Result<(), PlayerError> {
        self.shared
            .execute_command("Set volume to", Some(&volume.min(100).to_string()))
            .await
    }

    /// Adjust the output volume by a relative amount
    pub async fn adjust_volume(&self, delta: i8) -> Result<(), PlayerError> {
        self.shared
            .execute_command("Adjust volume by", Some(&delta.to_string()))
            .await
    }

    /// Set mute. The device only exposes a toggle, so this is a no-op
    /// when the tracked state already matches.
    pub async fn set_muted(&self, muted: bool) -> Result<(), PlayerError> {
        let current = self.shared.core.lock().await.sync.status().muted;
        if current == muted {
            return Ok(());
        }

        self.shared.execute_command("Toggle mute", None).await?;

        let mut core = self.shared.core.lock().await;
        core.sync.set_muted(muted);
        self.shared.schedule_status_update(&mut core);
        Ok(())
    }
}

impl PlayerShared {
    /// Apply one raw payload on the single-owner timeline and carry out
    /// the effects it requests
    async fn handle_payload(self: &Arc<Self>, payload: Value) {
        let mut core = self.core.lock().await;
        let effects = core.sync.apply(&payload);

        if let Some(transition) = effects.cache_transition {
            // Synchronous with the transition, so no later read in this
            // timeline can observe pre-transition listings
            self.gateway.invalidate_cache(None).await;
            let _ = self
                .events
                .send(PlayerEvent::CacheInvalidated(transition));
        }

        if let Some(controllers) = effects.controllers_changed {
            debug!(count = controllers.len(), "controller health changed");
            let _ = self
                .events
                .send(PlayerEvent::ControllerHealthChanged(controllers));
        }

        if let Some(playlist) = effects.playlist_changed_to {
            // Refetch off the timeline so dependent views are not blank
            // while the device settles into the new playlist
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                shared.refresh_playlist_steps(playlist).await;
            });
        }

        if let Some(song) = effects.song_started {
            self.advance_queue_for(&song, &mut core);
        }

        self.schedule_status_update(&mut core);
    }

    /// A queued song started on the device: drop it and chase the new head
    fn advance_queue_for(self: &Arc<Self>, song: &str, core: &mut PlayerCore) {
        match core.queue.song_started(song) {
            SongStartOutcome::NoMatch => {}
            SongStartOutcome::RemovedQueueEmpty => {
                debug!(song, "queued song started, queue now empty");
            }
            SongStartOutcome::RemovedNewHead(head) => {
                info!(song, next = %head.song_name, "queued song started, jumping to next");
                // No synchronous caller to report to on this path: a
                // failed jump is logged and the head stays queued
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = shared.send_jump(&head.song_name).await {
                        warn!(
                            error = %e,
                            song = %head.song_name,
                            "auto-advance jump failed, item remains queued"
                        );
                    }
                });
            }
        }
    }

    async fn refresh_playlist_steps(self: Arc<Self>, playlist: String) {
        match self.gateway.playlist_steps(&playlist, false).await {
            Ok(steps) => {
                let mut core = self.core.lock().await;
                // The playlist may have changed again while we fetched
                if core.sync.status().playlist_name.as_deref() == Some(playlist.as_str()) {
                    core.sync.set_playlist_steps(steps);
                    self.schedule_status_update(&mut core);
                }
            }
            Err(e) => {
                warn!(error = %e, playlist = %playlist, "failed to refresh playlist steps");
            }
        }
    }

    /// Issue the head-jump command for a step
    async fn send_jump(&self, step: &str) -> Result<(), PlayerError> {
        self.execute_command(JUMP_COMMAND, Some(step)).await
    }

    /// Issue a device command, preferring the push channel and falling
    /// back to the HTTP gateway when it is down. Playback-affecting
    /// commands invalidate the listing cache on either path.
    async fn execute_command(
        &self,
        name: &str,
        parameters: Option<&str>,
    ) -> Result<(), PlayerError> {
        match self
            .channel
            .send_command(name, parameters.unwrap_or_default())
            .await
        {
            Ok(()) => {
                if is_playback_affecting(name) {
                    self.gateway.invalidate_cache(None).await;
                }
                Ok(())
            }
            Err(ChannelSendError::NotConnected) => {
                // The gateway applies its own invalidation rule
                self.gateway.command(name, parameters).await?;
                Ok(())
            }
        }
    }

    /// Arm (or re-arm) the debounced status notification. The emission
    /// checks liveness when it fires, so a torn-down player stays silent.
    fn schedule_status_update(self: &Arc<Self>, core: &mut PlayerCore) {
        let weak: Weak<PlayerShared> = Arc::downgrade(self);
        core.scheduler.schedule(async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            let status = shared.core.lock().await.sync.status().clone();
            let _ = shared.events.send(PlayerEvent::StatusChanged(status));
        });
    }
}

/// Feed payloads from the push channel into the single-owner timeline
async fn pump_payloads(shared: Weak<PlayerShared>, mut payload_rx: mpsc::Receiver<Value>) {
    while let Some(payload) = payload_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        shared.handle_payload(payload).await;
    }
}
