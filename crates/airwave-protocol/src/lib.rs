//! # airwave-protocol
//!
//! Wire protocol definitions for the Airwave shared radio engine.
//!
//! Every message exchanged with a listener is an envelope of the form
//! `{"type": "...", "payload": {...}}`. Listeners receive [`ServerFrame`]s
//! (state changes, reactions, control replies) and send [`ClientFrame`]s
//! (resync requests, reactions, keepalives).
//!
//! ## Frame Types
//!
//! - `song_change` / `skip` / `previous` - A new song became current
//! - `queue_update` - Full queue snapshot
//! - `playback_update` - Progress bar reconciliation
//! - `playlist_change` - A different playlist was activated
//! - `user_reaction` - Ephemeral emote from a listener
//! - `state` - Full playback snapshot (sent on connect and on `sync`)
//!
//! ## Example
//!
//! ```rust
//! use airwave_protocol::{codec, ServerFrame};
//!
//! let frame = ServerFrame::ack(7);
//! let text = codec::encode_json(&frame).unwrap();
//! let decoded: ServerFrame = codec::decode_json(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod model;
pub mod version;

pub use codec::{decode, decode_json, encode, encode_json, Encoding, ProtocolError};
pub use frames::{ClientFrame, ServerFrame};
pub use model::{
    Emote, PlaybackSnapshot, PlaybackUpdatePayload, PlaylistChangePayload, PlaylistInfo,
    QueueUpdatePayload, ReactionPayload, Song, SongChangePayload, SongId,
};
pub use version::{Version, PROTOCOL_VERSION};
