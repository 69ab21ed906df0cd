//! Song and playlist lookups consumed by the timeline.
//!
//! The timeline only reads from the catalog, apart from recording play
//! statistics. [`MemoryCatalog`] is the in-process implementation used by
//! the server and by tests.

use crate::clock::Clock;
use crate::error::RadioError;
use airwave_protocol::{Song, SongId};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// An ordered list of song ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    /// Playlist identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Songs in playback order.
    #[serde(default)]
    pub songs: Vec<SongId>,
}

/// Storage collaborator.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Look up a song.
    async fn song(&self, id: &str) -> Result<Song, RadioError>;

    /// Any song, chosen uniformly.
    async fn random_song(&self) -> Result<Song, RadioError>;

    /// The song with the fewest plays.
    async fn least_played_song(&self) -> Result<Song, RadioError>;

    /// Increment a song's play count and stamp its last-played time.
    async fn record_play(&self, id: &str) -> Result<(), RadioError>;

    /// Look up a playlist.
    async fn playlist(&self, id: &str) -> Result<Playlist, RadioError>;

    /// Resolve a playlist to songs, in playlist order.
    async fn playlist_songs(&self, id: &str) -> Result<Vec<Song>, RadioError>;
}

/// One `[[songs]]` entry of a library file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarySong {
    pub id: SongId,
    pub title: String,
    pub artist: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub storage_key: Option<String>,
}

/// Songs and playlists to seed a [`MemoryCatalog`] with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    pub songs: Vec<LibrarySong>,
    #[serde(default)]
    pub playlists: Vec<Playlist>,
}

/// In-memory catalog.
#[derive(Debug)]
pub struct MemoryCatalog {
    songs: DashMap<SongId, Song>,
    playlists: DashMap<String, Playlist>,
    clock: Arc<dyn Clock>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            songs: DashMap::new(),
            playlists: DashMap::new(),
            clock,
        }
    }

    /// Create a catalog from a parsed library file.
    #[must_use]
    pub fn from_library(library: Library, clock: Arc<dyn Clock>) -> Self {
        let catalog = Self::new(clock);
        for entry in library.songs {
            let mut song = Song::new(
                entry.id,
                entry.title,
                entry.artist,
                Duration::from_secs(entry.duration_secs),
            );
            if let Some(key) = entry.storage_key {
                song = song.with_storage_key(key);
            }
            catalog.insert_song(song);
        }
        for playlist in library.playlists {
            catalog.insert_playlist(playlist);
        }
        debug!(
            songs = catalog.song_count(),
            playlists = catalog.playlist_count(),
            "Catalog loaded"
        );
        catalog
    }

    /// Add or replace a song.
    pub fn insert_song(&self, song: Song) {
        self.songs.insert(song.id.clone(), song);
    }

    /// Add or replace a playlist.
    pub fn insert_playlist(&self, playlist: Playlist) {
        self.playlists.insert(playlist.id.clone(), playlist);
    }

    /// Number of songs.
    #[must_use]
    pub fn song_count(&self) -> usize {
        self.songs.len()
    }

    /// Number of playlists.
    #[must_use]
    pub fn playlist_count(&self) -> usize {
        self.playlists.len()
    }

    fn empty() -> RadioError {
        RadioError::NotFound("catalog has no songs".into())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn song(&self, id: &str) -> Result<Song, RadioError> {
        self.songs
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| RadioError::NotFound(format!("song {id}")))
    }

    async fn random_song(&self) -> Result<Song, RadioError> {
        self.songs
            .iter()
            .choose(&mut rand::thread_rng())
            .map(|s| s.clone())
            .ok_or_else(Self::empty)
    }

    async fn least_played_song(&self) -> Result<Song, RadioError> {
        // Never-played songs sort first; ties resolve by id for stable picks.
        self.songs
            .iter()
            .min_by(|a, b| {
                (a.play_count, a.last_played, &a.id).cmp(&(b.play_count, b.last_played, &b.id))
            })
            .map(|s| s.clone())
            .ok_or_else(Self::empty)
    }

    async fn record_play(&self, id: &str) -> Result<(), RadioError> {
        let mut song = self
            .songs
            .get_mut(id)
            .ok_or_else(|| RadioError::NotFound(format!("song {id}")))?;
        song.play_count += 1;
        song.last_played = Some(self.clock.now_millis());
        Ok(())
    }

    async fn playlist(&self, id: &str) -> Result<Playlist, RadioError> {
        self.playlists
            .get(id)
            .map(|p| p.clone())
            .ok_or_else(|| RadioError::NotFound(format!("playlist {id}")))
    }

    async fn playlist_songs(&self, id: &str) -> Result<Vec<Song>, RadioError> {
        let playlist = self.playlist(id).await?;
        let mut songs = Vec::with_capacity(playlist.songs.len());
        for song_id in &playlist.songs {
            match self.songs.get(song_id) {
                Some(song) => songs.push(song.clone()),
                None => warn!(playlist = %id, song = %song_id, "Playlist references unknown song"),
            }
        }
        Ok(songs)
    }
}
