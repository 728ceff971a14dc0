//! Client-side "play next" priority queue
//!
//! The device's native queue is plain FIFO; this queue layers priorities
//! on top and keeps its head synchronized with the device via jump
//! commands. The queue is volatile by design and does not survive a
//! restart.
//!
//! Ordering invariant: descending priority, ties in insertion order. An
//! inserted or bumped item is placed after every item of equal or higher
//! priority, which is what a stable sort by descending priority would
//! produce. An explicit `reorder` replaces the order outright.

use serde::Serialize;
use uuid::Uuid;

use crate::error::PlayerError;

/// One queued song
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    /// Client-generated identifier, stable across bumps and reorders
    pub id: Uuid,

    /// Step (song) name within the playlist
    pub song_name: String,

    /// Playlist the song belongs to
    pub playlist_name: String,

    /// Play-next priority; starts at 1 and grows by repeated adds
    pub priority: u32,

    /// Song duration in milliseconds, from the step listing
    pub duration_ms: u64,
}

/// Result of the song-started hook
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SongStartOutcome {
    /// The started song was not queued; nothing to do
    NoMatch,
    /// The matching item was removed and the queue is now empty
    RemovedQueueEmpty,
    /// The matching item was removed; this is the new head to jump to
    RemovedNewHead(QueueItem),
}

/// Outcome of an add: the item's id and whether it now heads the queue
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct AddOutcome {
    pub id: Uuid,
    pub is_head: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PlayQueue {
    items: Vec<QueueItem>,
}

impl PlayQueue {
    pub(crate) fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub(crate) fn head(&self) -> Option<&QueueItem> {
        self.items.first()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert a song, or bump its priority if it is already queued.
    /// At most one item per distinct song name ever exists.
    pub(crate) fn add(
        &mut self,
        song_name: &str,
        playlist_name: &str,
        duration_ms: u64,
    ) -> AddOutcome {
        let item = match self.items.iter().position(|i| i.song_name == song_name) {
            Some(index) => {
                let mut item = self.items.remove(index);
                item.priority += 1;
                item
            }
            None => QueueItem {
                id: Uuid::new_v4(),
                song_name: song_name.to_string(),
                playlist_name: playlist_name.to_string(),
                priority: 1,
                duration_ms,
            },
        };

        let id = item.id;
        self.place(item);

        AddOutcome {
            id,
            is_head: self.items.first().map(|i| i.id) == Some(id),
        }
    }

    /// Place after every item of >= priority, before the first lower one
    fn place(&mut self, item: QueueItem) {
        let index = self
            .items
            .iter()
            .position(|i| i.priority < item.priority)
            .unwrap_or(self.items.len());
        self.items.insert(index, item);
    }

    /// Remove one item by id. Removing the head is inert; only an
    /// explicit reorder or a song start moves the device.
    pub(crate) fn remove(&mut self, id: Uuid) -> Result<QueueItem, PlayerError> {
        match self.items.iter().position(|i| i.id == id) {
            Some(index) => Ok(self.items.remove(index)),
            None => Err(PlayerError::UnknownQueueItem(id)),
        }
    }

    /// Replace the ordering. `ids` must name exactly the current items.
    /// Returns whether the head changed.
    pub(crate) fn reorder(&mut self, ids: &[Uuid]) -> Result<bool, PlayerError> {
        if ids.len() != self.items.len() {
            return Err(PlayerError::ReorderMismatch);
        }

        // Consume from a working copy so duplicate ids cannot pass
        let mut remaining = self.items.clone();
        let mut reordered = Vec::with_capacity(ids.len());
        for id in ids {
            match remaining.iter().position(|i| i.id == *id) {
                Some(index) => reordered.push(remaining.remove(index)),
                None => return Err(PlayerError::ReorderMismatch),
            }
        }

        let old_head = self.items.first().map(|i| i.id);
        self.items = reordered;
        Ok(old_head != self.items.first().map(|i| i.id))
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    /// The device reported this song started: drop the matching item and
    /// report the new head, if any, so a jump can be issued for it
    pub(crate) fn song_started(&mut self, song_name: &str) -> SongStartOutcome {
        let Some(index) = self.items.iter().position(|i| i.song_name == song_name) else {
            return SongStartOutcome::NoMatch;
        };
        self.items.remove(index);

        match self.items.first() {
            Some(head) => SongStartOutcome::RemovedNewHead(head.clone()),
            None => SongStartOutcome::RemovedQueueEmpty,
        }
    }
}
