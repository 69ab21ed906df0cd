//! Payload types carried inside frames.
//!
//! All payloads are plain value snapshots. Nothing here refers back to
//! live server state, so a frame can be encoded once and shared between
//! any number of connections.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A song identifier as assigned by the catalog.
pub type SongId = String;

/// Immutable song reference data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    /// Catalog identifier.
    pub id: SongId,
    /// Song title.
    pub title: String,
    /// Performing artist.
    pub artist: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Key of the audio object in storage.
    pub storage_key: String,
    /// Number of times this song has been played.
    #[serde(default)]
    pub play_count: u64,
    /// When this song was last played (epoch milliseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played: Option<u64>,
}

impl Song {
    /// Create a song with empty statistics.
    #[must_use]
    pub fn new(
        id: impl Into<SongId>,
        title: impl Into<String>,
        artist: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let id = id.into();
        Self {
            storage_key: id.clone(),
            id,
            title: title.into(),
            artist: artist.into(),
            duration_ms: duration.as_millis() as u64,
            play_count: 0,
            last_played: None,
        }
    }

    /// Set the storage key.
    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Song duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Summary of the active playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistInfo {
    /// Playlist identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Number of songs in the materialized queue.
    pub song_count: usize,
}

/// Full playback state as seen at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    /// Mutation sequence number. Strictly increasing over the process lifetime.
    pub seq: u64,
    /// Active playlist, `None` before the first activation.
    pub playlist: Option<PlaylistInfo>,
    /// Playback order.
    pub queue: Vec<Song>,
    /// Index of the current song in `queue`.
    pub current_index: usize,
    /// Currently playing song.
    pub current: Option<Song>,
    /// Song that follows the current one.
    pub next: Option<Song>,
    /// When the current song started (epoch milliseconds, pause-adjusted).
    pub start_time: u64,
    /// Elapsed playback of the current song.
    pub elapsed_ms: u64,
    /// Remaining playback of the current song.
    pub remaining_ms: u64,
    /// Whether playback is paused.
    pub paused: bool,
    /// Server wall clock when the snapshot was taken (epoch milliseconds).
    pub server_time: u64,
}

/// Payload of `song_change`, `skip` and `previous` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongChangePayload {
    /// Mutation sequence number.
    pub seq: u64,
    /// The song that just became current.
    pub current: Song,
    /// The song after it.
    pub next: Song,
    /// Full queue.
    pub queue: Vec<Song>,
    /// Index of `current` in `queue`.
    pub current_index: usize,
    /// Remaining playback of `current`.
    pub remaining_ms: u64,
    /// When `current` started (epoch milliseconds).
    pub start_time: u64,
}

/// Payload of `queue_update` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueUpdatePayload {
    /// Mutation sequence number.
    pub seq: u64,
    /// Full queue.
    pub queue: Vec<Song>,
    /// Index of the current song.
    pub current_index: usize,
}

/// Payload of `playback_update` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackUpdatePayload {
    /// Mutation sequence number of the state this update was computed from.
    pub seq: u64,
    /// Current song identifier.
    pub song_id: SongId,
    /// Elapsed playback.
    pub elapsed_ms: u64,
    /// Remaining playback.
    pub remaining_ms: u64,
    /// Whether playback is paused.
    pub paused: bool,
    /// Server wall clock (epoch milliseconds), for client drift correction.
    pub server_time: u64,
}

/// Payload of `playlist_change` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistChangePayload {
    /// The newly activated playlist.
    pub playlist: PlaylistInfo,
    /// First song of the new queue.
    pub current: Song,
    /// Song after it.
    pub next: Song,
    /// Full state after activation.
    pub state: PlaybackSnapshot,
}

/// Payload of `user_reaction` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    /// Reacting user.
    pub user_id: String,
    /// The emote sent.
    pub emote: Emote,
    /// Epoch milliseconds, for display ordering only.
    pub timestamp: u64,
}

/// The fixed set of reaction emotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emote {
    Heart,
    Fire,
    Laugh,
    Clap,
    Wow,
    Sad,
    Party,
    Hundred,
}

impl Emote {
    /// Every accepted emote.
    pub const ALL: [Emote; 8] = [
        Emote::Heart,
        Emote::Fire,
        Emote::Laugh,
        Emote::Clap,
        Emote::Wow,
        Emote::Sad,
        Emote::Party,
        Emote::Hundred,
    ];

    /// Wire name of the emote.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Emote::Heart => "heart",
            Emote::Fire => "fire",
            Emote::Laugh => "laugh",
            Emote::Clap => "clap",
            Emote::Wow => "wow",
            Emote::Sad => "sad",
            Emote::Party => "party",
            Emote::Hundred => "hundred",
        }
    }
}

impl fmt::Display for Emote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emote {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emote::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or("Unknown emote")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emote_parse() {
        assert_eq!("fire".parse::<Emote>(), Ok(Emote::Fire));
        assert_eq!("hundred".parse::<Emote>(), Ok(Emote::Hundred));
        assert!("sparkle".parse::<Emote>().is_err());
        assert!("Heart".parse::<Emote>().is_err());
    }

    #[test]
    fn test_emote_serde_name_matches_as_str() {
        for emote in Emote::ALL {
            let json = serde_json::to_string(&emote).unwrap();
            assert_eq!(json, format!("\"{}\"", emote.as_str()));
        }
    }

    #[test]
    fn test_song_defaults_storage_key_to_id() {
        let song = Song::new("s1", "Title", "Artist", Duration::from_secs(180));
        assert_eq!(song.storage_key, "s1");
        assert_eq!(song.duration_ms, 180_000);
        assert_eq!(song.duration(), Duration::from_secs(180));

        let song = song.with_storage_key("audio/s1.mp3");
        assert_eq!(song.storage_key, "audio/s1.mp3");
    }

    #[test]
    fn test_song_statistics_default_when_missing() {
        let song: Song = serde_json::from_str(
            r#"{"id":"a","title":"t","artist":"x","duration_ms":1000,"storage_key":"k"}"#,
        )
        .unwrap();
        assert_eq!(song.play_count, 0);
        assert!(song.last_played.is_none());
    }
}
