//! Domain events routed through the [`EventBus`](crate::bus::EventBus).
//!
//! An [`Event`] is an immutable snapshot. Once built it shares nothing with
//! the live playback state, so slow subscribers can never observe a torn
//! update.

use airwave_protocol::{
    PlaybackUpdatePayload, PlaylistChangePayload, QueueUpdatePayload, ReactionPayload,
    ServerFrame, SongChangePayload,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique event identifier.
pub type EventId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Routing key for bus subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    SongChange,
    QueueUpdate,
    PlaybackUpdate,
    UserReaction,
    Skip,
    Previous,
    PlaylistChange,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 7] = [
        EventKind::SongChange,
        EventKind::QueueUpdate,
        EventKind::PlaybackUpdate,
        EventKind::UserReaction,
        EventKind::Skip,
        EventKind::Previous,
        EventKind::PlaylistChange,
    ];

    /// Wire name, identical to the `type` of the matching frame.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SongChange => "song_change",
            EventKind::QueueUpdate => "queue_update",
            EventKind::PlaybackUpdate => "playback_update",
            EventKind::UserReaction => "user_reaction",
            EventKind::Skip => "skip",
            EventKind::Previous => "previous",
            EventKind::PlaylistChange => "playlist_change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    SongChange(SongChangePayload),
    QueueUpdate(QueueUpdatePayload),
    PlaybackUpdate(PlaybackUpdatePayload),
    UserReaction(ReactionPayload),
    Skip(SongChangePayload),
    Previous(SongChangePayload),
    PlaylistChange(PlaylistChangePayload),
}

impl EventPayload {
    /// The routing key of this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SongChange(_) => EventKind::SongChange,
            EventPayload::QueueUpdate(_) => EventKind::QueueUpdate,
            EventPayload::PlaybackUpdate(_) => EventKind::PlaybackUpdate,
            EventPayload::UserReaction(_) => EventKind::UserReaction,
            EventPayload::Skip(_) => EventKind::Skip,
            EventPayload::Previous(_) => EventKind::Previous,
            EventPayload::PlaylistChange(_) => EventKind::PlaylistChange,
        }
    }
}

/// An event as published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// Event payload.
    pub payload: EventPayload,
    /// Epoch milliseconds when the event was created.
    pub timestamp: u64,
}

impl Event {
    /// Create an event stamped with the given epoch milliseconds.
    #[must_use]
    pub fn new(payload: EventPayload, timestamp: u64) -> Self {
        Self {
            id: generate_event_id(),
            payload,
            timestamp,
        }
    }

    /// The routing key of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Build the wire frame for this event.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        match &self.payload {
            EventPayload::SongChange(p) => ServerFrame::SongChange(p.clone()),
            EventPayload::QueueUpdate(p) => ServerFrame::QueueUpdate(p.clone()),
            EventPayload::PlaybackUpdate(p) => ServerFrame::PlaybackUpdate(p.clone()),
            EventPayload::UserReaction(p) => ServerFrame::UserReaction(p.clone()),
            EventPayload::Skip(p) => ServerFrame::Skip(p.clone()),
            EventPayload::Previous(p) => ServerFrame::Previous(p.clone()),
            EventPayload::PlaylistChange(p) => ServerFrame::PlaylistChange(p.clone()),
        }
    }
}
