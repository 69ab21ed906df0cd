//! Library file loading.
//!
//! ```toml
//! [[songs]]
//! id = "s1"
//! title = "Opening"
//! artist = "The Band"
//! duration_secs = 180
//! storage_key = "audio/s1.mp3"
//!
//! [[playlists]]
//! id = "morning"
//! name = "Morning Mix"
//! songs = ["s1"]
//! ```

use airwave_core::Library;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Read and validate a library file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML.
pub fn load(path: &Path) -> Result<Library> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read library file: {}", path.display()))?;
    let library = parse(&contents)
        .with_context(|| format!("Failed to parse library file: {}", path.display()))?;

    info!(
        path = %path.display(),
        songs = library.songs.len(),
        playlists = library.playlists.len(),
        "Library loaded"
    );
    Ok(library)
}

/// Parse library TOML, dropping songs that cannot be played.
///
/// Zero-length songs would end the moment they start, and a repeated id
/// would shadow the earlier entry, so both are skipped with a warning.
///
/// # Errors
///
/// Returns an error if the TOML does not describe a library.
pub fn parse(contents: &str) -> Result<Library> {
    let mut library: Library = toml::from_str(contents)?;

    let mut seen = HashSet::new();
    library.songs.retain(|song| {
        if song.duration_secs == 0 {
            warn!(song = %song.id, "Skipping song with zero duration");
            return false;
        }
        if !seen.insert(song.id.clone()) {
            warn!(song = %song.id, "Skipping duplicate song id");
            return false;
        }
        true
    });

    Ok(library)
}
