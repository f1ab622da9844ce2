use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::{collections::VecDeque, time::Duration};
use tracing::debug;

use crate::protocol::Track;

/// Most-recently-played tracks kept per queue.
const MAX_HISTORY: usize = 20;

/// What happens when the current track finishes naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Linear playback.
    #[default]
    Off,
    /// Replay the current track.
    Track,
    /// Cycle the upcoming list, pushing the finished track to the tail.
    Queue,
}

/// A track enqueued for a guild, with the client-side annotations the server
/// never sees.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTrack {
    pub track: Track,
    /// User that requested the track, when the host bot supplies one.
    pub requested_by: Option<u64>,
    pub added_at: DateTime<Utc>,
}

impl From<Track> for QueuedTrack {
    fn from(track: Track) -> Self {
        Self {
            track,
            requested_by: None,
            added_at: Utc::now(),
        }
    }
}

impl QueuedTrack {
    pub fn with_requester(track: Track, requested_by: u64) -> Self {
        Self {
            track,
            requested_by: Some(requested_by),
            added_at: Utc::now(),
        }
    }
}

/// Ordered track list for one player: upcoming tracks, one optional current
/// track, and a bounded most-recent-first history.
///
/// `current` moves to the history whenever it is replaced by a new value;
/// every history write goes through [`Queue::advance_to`] or
/// [`Queue::end_current`] so the bound holds everywhere.
#[derive(Debug, Default)]
pub struct Queue {
    upcoming: VecDeque<QueuedTrack>,
    current: Option<QueuedTrack>,
    history: VecDeque<QueuedTrack>,
    loop_mode: LoopMode,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a track at the tail.
    pub fn add(&mut self, track: QueuedTrack) {
        debug!(title = %track.track.info.title, "queued track");
        self.upcoming.push_back(track);
    }

    /// Inserts a track at a 0-indexed position; positions past the tail
    /// clamp to an append.
    pub fn insert(&mut self, position: usize, track: QueuedTrack) {
        let position = position.min(self.upcoming.len());
        self.upcoming.insert(position, track);
    }

    /// Appends several tracks, preserving their order.
    pub fn add_all(&mut self, tracks: impl IntoIterator<Item = QueuedTrack>) {
        self.upcoming.extend(tracks);
    }

    /// Returns the next track honoring the loop mode.
    ///
    /// - `Track`: returns the current track unchanged; the caller replays it.
    /// - `Queue`: re-appends the current track to the tail, then pops the
    ///   head as the new current.
    /// - `Off`: pops the head as the new current.
    ///
    /// When the head pop yields nothing, `current` is left untouched and the
    /// caller decides how to finish (see the player's queue progression).
    pub fn poll(&mut self) -> Option<QueuedTrack> {
        match self.loop_mode {
            LoopMode::Track => self.current.clone(),
            LoopMode::Queue => {
                if let Some(current) = self.current.clone() {
                    self.upcoming.push_back(current);
                }
                let next = self.upcoming.pop_front()?;
                self.advance_to(next.clone());
                Some(next)
            }
            LoopMode::Off => {
                let next = self.upcoming.pop_front()?;
                self.advance_to(next.clone());
                Some(next)
            }
        }
    }

    /// Head of the upcoming list without removing it.
    pub fn peek(&self) -> Option<&QueuedTrack> {
        self.upcoming.front()
    }

    /// Makes `track` the current one, moving the previous current to the
    /// history. Replaying the same track leaves the history alone.
    pub fn advance_to(&mut self, track: QueuedTrack) {
        let replay = self
            .current
            .as_ref()
            .is_some_and(|current| current.track.encoded == track.track.encoded);
        if let Some(previous) = self.current.replace(track) {
            if !replay {
                self.push_history(previous);
            }
        }
    }

    /// Pops the head as the new current, ignoring the loop mode. Used when
    /// the current track cannot continue and a `Track` loop must not replay
    /// it.
    pub fn force_next(&mut self) -> Option<QueuedTrack> {
        let next = self.upcoming.pop_front()?;
        self.advance_to(next.clone());
        Some(next)
    }

    /// Clears the current track, moving it to the history.
    pub fn end_current(&mut self) -> Option<QueuedTrack> {
        let previous = self.current.take();
        if let Some(track) = previous.clone() {
            self.push_history(track);
        }
        previous
    }

    /// Removes the track at `index` from the upcoming list.
    pub fn remove_at(&mut self, index: usize) -> Option<QueuedTrack> {
        self.upcoming.remove(index)
    }

    /// Removes the first upcoming track with the given encoded string.
    pub fn remove(&mut self, encoded: &str) -> Option<QueuedTrack> {
        let index = self
            .upcoming
            .iter()
            .position(|item| item.track.encoded == encoded)?;
        self.upcoming.remove(index)
    }

    /// Moves an upcoming track from one position to another.
    pub fn move_track(&mut self, from: usize, to: usize) -> bool {
        if from >= self.upcoming.len() || to >= self.upcoming.len() {
            return false;
        }
        if from != to {
            if let Some(item) = self.upcoming.remove(from) {
                self.upcoming.insert(to, item);
            }
        }
        true
    }

    /// Drops duplicate upcoming tracks (by encoded string), keeping the
    /// first occurrence. Returns how many were removed.
    pub fn dedup(&mut self) -> usize {
        let mut seen = std::collections::HashSet::new();
        let before = self.upcoming.len();
        self.upcoming
            .retain(|item| seen.insert(item.track.encoded.clone()));
        before - self.upcoming.len()
    }

    /// Empties upcoming, history and the current track.
    pub fn clear(&mut self) {
        self.upcoming.clear();
        self.history.clear();
        self.current = None;
    }

    /// In-place Fisher-Yates over the upcoming list only; the current track
    /// and the history are untouched.
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.upcoming.make_contiguous().shuffle(&mut rng);
    }

    pub fn set_loop(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn current(&self) -> Option<&QueuedTrack> {
        self.current.as_ref()
    }

    /// Most-recent-first played tracks, at most [`MAX_HISTORY`].
    pub fn history(&self) -> impl Iterator<Item = &QueuedTrack> {
        self.history.iter()
    }

    /// Number of upcoming tracks; the current track is not counted.
    pub fn size(&self) -> usize {
        self.upcoming.len()
    }

    /// History + upcoming + current.
    pub fn total_size(&self) -> usize {
        self.history.len() + self.upcoming.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.upcoming.is_empty()
    }

    /// Point-in-time copy for display purposes.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.clone(),
            upcoming: self.upcoming.iter().cloned().collect(),
            loop_mode: self.loop_mode,
            remaining: self.remaining_duration(),
        }
    }

    fn push_history(&mut self, track: QueuedTrack) {
        self.history.push_front(track);
        self.history.truncate(MAX_HISTORY);
    }

    /// Summed length of current + upcoming, skipping live streams.
    fn remaining_duration(&self) -> Duration {
        let upcoming: u64 = self
            .upcoming
            .iter()
            .filter(|item| !item.track.info.is_stream)
            .map(|item| item.track.info.length)
            .sum();
        let current = self
            .current
            .as_ref()
            .filter(|item| !item.track.info.is_stream)
            .map_or(0, |item| item.track.info.length);
        Duration::from_millis(upcoming + current)
    }
}

/// Immutable view of a queue, paginatable for display.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<QueuedTrack>,
    pub upcoming: Vec<QueuedTrack>,
    pub loop_mode: LoopMode,
    pub remaining: Duration,
}

impl QueueSnapshot {
    /// Returns one page of the upcoming list. Pages are 1-indexed.
    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let per_page = per_page.max(1);
        let page = page.max(1);
        let total_items = self.upcoming.len();
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(per_page)
        };
        let start = (page - 1) * per_page;
        let end = (start + per_page).min(total_items);
        QueuePage {
            items: if start < total_items {
                self.upcoming[start..end].to_vec()
            } else {
                Vec::new()
            },
            current_page: page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<QueuedTrack>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
