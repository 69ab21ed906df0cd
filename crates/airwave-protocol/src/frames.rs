//! Frame types for the Airwave protocol.
//!
//! Frames are adjacently tagged: `{"type": "<name>", "payload": {...}}`.

use serde::{Deserialize, Serialize};

use crate::model::{
    PlaybackSnapshot, PlaybackUpdatePayload, PlaylistChangePayload, QueueUpdatePayload,
    ReactionPayload, SongChangePayload,
};

/// A frame sent from the server to a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The timeline advanced naturally to a new song.
    SongChange(SongChangePayload),
    /// Full queue snapshot.
    QueueUpdate(QueueUpdatePayload),
    /// Periodic progress or pause/resume update.
    PlaybackUpdate(PlaybackUpdatePayload),
    /// Ephemeral listener reaction.
    UserReaction(ReactionPayload),
    /// An operator skipped forward.
    Skip(SongChangePayload),
    /// An operator went back one song.
    Previous(SongChangePayload),
    /// A different playlist was activated.
    PlaylistChange(PlaylistChangePayload),
    /// Full state, sent on connect and in reply to `sync`.
    State(PlaybackSnapshot),
    /// Acknowledgment of a client request.
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },
    /// Error response.
    Error {
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },
    /// Keepalive reply.
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Wire name of this frame.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerFrame::SongChange(_) => "song_change",
            ServerFrame::QueueUpdate(_) => "queue_update",
            ServerFrame::PlaybackUpdate(_) => "playback_update",
            ServerFrame::UserReaction(_) => "user_reaction",
            ServerFrame::Skip(_) => "skip",
            ServerFrame::Previous(_) => "previous",
            ServerFrame::PlaylistChange(_) => "playlist_change",
            ServerFrame::State(_) => "state",
            ServerFrame::Ack { .. } => "ack",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Sequence number of the playback state this frame describes.
    ///
    /// Frames that do not describe playback state (reactions, control
    /// replies) return `None` and are never considered stale.
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        match self {
            ServerFrame::SongChange(p) | ServerFrame::Skip(p) | ServerFrame::Previous(p) => {
                Some(p.seq)
            }
            ServerFrame::QueueUpdate(p) => Some(p.seq),
            ServerFrame::PlaybackUpdate(p) => Some(p.seq),
            ServerFrame::PlaylistChange(p) => Some(p.state.seq),
            ServerFrame::State(s) => Some(s.seq),
            ServerFrame::UserReaction(_)
            | ServerFrame::Ack { .. }
            | ServerFrame::Error { .. }
            | ServerFrame::Pong { .. } => None,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        ServerFrame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }
}

/// A frame sent from a listener to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Request a full state snapshot.
    Sync,
    /// Send a reaction. The emote is validated server-side.
    Reaction {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Reacting user.
        user_id: String,
        /// Emote name.
        emote: String,
    },
    /// Keepalive.
    Ping {
        /// Optional timestamp, echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Create a new Reaction frame.
    #[must_use]
    pub fn reaction(user_id: impl Into<String>, emote: impl Into<String>) -> Self {
        ClientFrame::Reaction {
            id: None,
            user_id: user_id.into(),
            emote: emote.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        ClientFrame::Ping { timestamp }
    }
}
