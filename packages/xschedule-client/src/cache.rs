//! Read-through TTL caches for slow-changing device listings
//!
//! Playlist step listings, schedules and the playlist index are expensive
//! for the device to produce and change rarely, so they are cached with a
//! per-class TTL. Entries are dropped on explicit invalidation or expire on
//! read past their TTL; nothing is proactively swept.

use std::time::Duration;

use moka::future::Cache as MokaCache;

use crate::models::{PlaylistStep, ScheduleInfo};

/// TTL for playlist step listings
const STEPS_TTL: Duration = Duration::from_secs(3 * 60);

/// TTL for playlist schedules
const SCHEDULES_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL for the playlist index
const PLAYLISTS_TTL: Duration = Duration::from_secs(5 * 60);

/// Cache key for the (single) playlist index entry
const PLAYLISTS_KEY: &str = "playlists";

/// Per-operation-class caches, keyed by playlist name where applicable
#[derive(Clone)]
pub(crate) struct QueryCache {
    steps: MokaCache<String, Vec<PlaylistStep>>,
    schedules: MokaCache<String, Vec<ScheduleInfo>>,
    playlists: MokaCache<String, Vec<String>>,
}

impl QueryCache {
    pub(crate) fn new() -> Self {
        Self::with_ttls(STEPS_TTL, SCHEDULES_TTL, PLAYLISTS_TTL)
    }

    /// Build with explicit TTLs (shortened in tests)
    pub(crate) fn with_ttls(steps: Duration, schedules: Duration, playlists: Duration) -> Self {
        Self {
            steps: MokaCache::builder()
                .max_capacity(64)
                .time_to_live(steps)
                .build(),
            schedules: MokaCache::builder()
                .max_capacity(64)
                .time_to_live(schedules)
                .build(),
            playlists: MokaCache::builder()
                .max_capacity(1)
                .time_to_live(playlists)
                .build(),
        }
    }

    pub(crate) async fn get_steps(&self, playlist: &str) -> Option<Vec<PlaylistStep>> {
        self.steps.get(playlist).await
    }

    pub(crate) async fn put_steps(&self, playlist: String, steps: Vec<PlaylistStep>) {
        self.steps.insert(playlist, steps).await;
    }

    pub(crate) async fn get_schedules(&self, playlist: &str) -> Option<Vec<ScheduleInfo>> {
        self.schedules.get(playlist).await
    }

    pub(crate) async fn put_schedules(&self, playlist: String, schedules: Vec<ScheduleInfo>) {
        self.schedules.insert(playlist, schedules).await;
    }

    pub(crate) async fn get_playlists(&self) -> Option<Vec<String>> {
        self.playlists.get(PLAYLISTS_KEY).await
    }

    pub(crate) async fn put_playlists(&self, playlists: Vec<String>) {
        self.playlists
            .insert(PLAYLISTS_KEY.to_string(), playlists)
            .await;
    }

    /// Drop the entries for one playlist
    pub(crate) async fn invalidate_playlist(&self, playlist: &str) {
        self.steps.invalidate(playlist).await;
        self.schedules.invalidate(playlist).await;
    }

    /// Drop everything
    pub(crate) fn invalidate_all(&self) {
        self.steps.invalidate_all();
        self.schedules.invalidate_all();
        self.playlists.invalidate_all();
    }
}
