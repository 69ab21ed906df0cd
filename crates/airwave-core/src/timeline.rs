//! The playback timeline.
//!
//! [`Timeline`] owns the one authoritative [`PlaybackState`]. It is not
//! shared: the [`Radio`](crate::radio::Radio) task owns it and feeds it
//! commands and ticks one at a time, so every mutation is totally ordered.
//!
//! Every mutating operation first validates and fetches what it needs from
//! the catalog, then applies the whole transition, then publishes. Failures
//! never leave a half-applied state behind.

use crate::bus::EventBus;
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::RadioError;
use crate::event::{Event, EventPayload};
use airwave_protocol::{
    PlaybackSnapshot, PlaybackUpdatePayload, PlaylistChangePayload, PlaylistInfo,
    QueueUpdatePayload, Song, SongChangePayload,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Playlist id used for the auto-generated library queue.
pub const LIBRARY_PLAYLIST_ID: &str = "library";

/// Coarse timeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing activated yet.
    Stopped,
    Playing,
    Paused,
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Timeline is stopped; nothing published.
    Idle,
    /// Progress was published; no transition.
    Progress,
    /// The current song ended and the timeline moved on.
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Natural,
    Skip,
    Previous,
}

/// The authoritative playback state.
#[derive(Debug, Clone, Default)]
pub struct PlaybackState {
    queue: Vec<Song>,
    current_index: usize,
    start_time: u64,
    paused_at: Option<u64>,
    playlist: Option<PlaylistInfo>,
    seq: u64,
}

impl PlaybackState {
    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        if self.queue.is_empty() {
            Status::Stopped
        } else if self.paused_at.is_some() {
            Status::Paused
        } else {
            Status::Playing
        }
    }

    /// Playback order.
    #[must_use]
    pub fn queue(&self) -> &[Song] {
        &self.queue
    }

    /// Index of the current song.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Epoch milliseconds the current song started, pause-adjusted.
    #[must_use]
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Whether playback is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Mutation sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Active playlist.
    #[must_use]
    pub fn playlist(&self) -> Option<&PlaylistInfo> {
        self.playlist.as_ref()
    }

    /// The song playing now.
    #[must_use]
    pub fn current(&self) -> Option<&Song> {
        self.queue.get(self.current_index)
    }

    /// The song after the current one, wrapping at the end.
    #[must_use]
    pub fn next(&self) -> Option<&Song> {
        if self.queue.is_empty() {
            return None;
        }
        self.queue.get((self.current_index + 1) % self.queue.len())
    }

    /// Elapsed playback of the current song at `now`, clamped to its duration.
    #[must_use]
    pub fn elapsed_ms(&self, now: u64) -> u64 {
        let Some(song) = self.current() else {
            return 0;
        };
        let reference = self.paused_at.unwrap_or(now);
        reference
            .saturating_sub(self.start_time)
            .min(song.duration_ms)
    }

    /// Remaining playback of the current song at `now`.
    #[must_use]
    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.current()
            .map(|song| song.duration_ms - self.elapsed_ms(now))
            .unwrap_or(0)
    }

    /// Immutable copy of the state at `now`.
    #[must_use]
    pub fn snapshot(&self, now: u64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            seq: self.seq,
            playlist: self.playlist.clone(),
            queue: self.queue.clone(),
            current_index: self.current_index,
            current: self.current().cloned(),
            next: self.next().cloned(),
            start_time: self.start_time,
            elapsed_ms: self.elapsed_ms(now),
            remaining_ms: self.remaining_ms(now),
            paused: self.is_paused(),
            server_time: now,
        }
    }

    /// Move to `index` and restart the song clock. A paused timeline stays
    /// paused, at position zero.
    fn restart_at(&mut self, index: usize, now: u64) {
        self.current_index = index;
        self.start_time = now;
        if self.paused_at.is_some() {
            self.paused_at = Some(now);
        }
        self.seq += 1;
    }
}

/// The playback state machine.
pub struct Timeline {
    state: PlaybackState,
    catalog: Arc<dyn Catalog>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl Timeline {
    /// Create a stopped timeline.
    #[must_use]
    pub fn new(catalog: Arc<dyn Catalog>, bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: PlaybackState::default(),
            catalog,
            bus,
            clock,
        }
    }

    /// The live state. Only the owner of the timeline can see this.
    #[must_use]
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// Immutable copy of the state as of now.
    #[must_use]
    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.state.snapshot(self.clock.now_millis())
    }

    /// Activate a playlist from the catalog.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown playlist, `InvalidInput` if it resolves to
    /// no songs. The state is untouched on error.
    pub async fn activate_playlist(
        &mut self,
        playlist_id: &str,
    ) -> Result<PlaybackSnapshot, RadioError> {
        let playlist = self.catalog.playlist(playlist_id).await?;
        let songs = self.catalog.playlist_songs(playlist_id).await?;
        self.activate(playlist.id, playlist.name, songs)
    }

    /// Activate an auto-generated queue: the least played song, followed by
    /// distinct random songs, up to `len` songs.
    ///
    /// # Errors
    ///
    /// Fails if the catalog is empty or unavailable.
    pub async fn activate_library(&mut self, len: usize) -> Result<PlaybackSnapshot, RadioError> {
        let len = len.max(1);
        let mut seen = HashSet::new();
        let mut songs = Vec::with_capacity(len);

        let first = self.catalog.least_played_song().await?;
        seen.insert(first.id.clone());
        songs.push(first);

        // Random picks repeat; give up after a bounded number of draws.
        let mut draws = len * 4;
        while songs.len() < len && draws > 0 {
            draws -= 1;
            let song = self.catalog.random_song().await?;
            if seen.insert(song.id.clone()) {
                songs.push(song);
            }
        }

        self.activate(LIBRARY_PLAYLIST_ID.to_string(), "Library".to_string(), songs)
    }

    fn activate(
        &mut self,
        id: String,
        name: String,
        songs: Vec<Song>,
    ) -> Result<PlaybackSnapshot, RadioError> {
        let mut seen = HashSet::new();
        let queue: Vec<Song> = songs
            .into_iter()
            .filter(|song| seen.insert(song.id.clone()))
            .collect();

        if queue.is_empty() {
            return Err(RadioError::invalid(format!("playlist {id} has no songs")));
        }

        let now = self.clock.now_millis();
        let playlist = PlaylistInfo {
            id,
            name,
            song_count: queue.len(),
        };

        if let Some(old) = self.state.current() {
            debug!(song = %old.id, "Discarding remainder of current song");
        }

        self.state = PlaybackState {
            queue,
            current_index: 0,
            start_time: now,
            paused_at: None,
            playlist: Some(playlist.clone()),
            seq: self.state.seq + 1,
        };

        info!(
            playlist = %playlist.id,
            songs = playlist.song_count,
            seq = self.state.seq,
            "Playlist activated"
        );

        let snapshot = self.state.snapshot(now);
        if let (Some(current), Some(next)) = (snapshot.current.clone(), snapshot.next.clone()) {
            self.publish(
                EventPayload::PlaylistChange(PlaylistChangePayload {
                    playlist,
                    current,
                    next,
                    state: snapshot.clone(),
                }),
                now,
            );
        }
        Ok(snapshot)
    }

    /// Recompute position; advance if the current song is over, otherwise
    /// publish a progress update.
    pub async fn tick(&mut self) -> TickOutcome {
        let now = self.clock.now_millis();
        match self.state.status() {
            Status::Stopped => TickOutcome::Idle,
            Status::Playing if self.state.remaining_ms(now) == 0 => {
                self.transition(Transition::Natural).await;
                TickOutcome::Advanced
            }
            Status::Playing | Status::Paused => {
                self.publish_progress(now);
                TickOutcome::Progress
            }
        }
    }

    /// Jump to the next song.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if nothing is playing.
    pub async fn skip(&mut self) -> Result<PlaybackSnapshot, RadioError> {
        self.ensure_active("skip")?;
        self.transition(Transition::Skip).await;
        Ok(self.snapshot())
    }

    /// Go back one song, wrapping from the first to the last.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if nothing is playing.
    pub async fn previous(&mut self) -> Result<PlaybackSnapshot, RadioError> {
        self.ensure_active("previous")?;
        self.transition(Transition::Previous).await;
        Ok(self.snapshot())
    }

    /// Pause playback. Pausing a paused timeline changes nothing.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if nothing is playing.
    pub fn pause(&mut self) -> Result<PlaybackSnapshot, RadioError> {
        self.ensure_active("pause")?;
        let now = self.clock.now_millis();
        if self.state.paused_at.is_none() {
            self.state.paused_at = Some(now);
            self.state.seq += 1;
            debug!(seq = self.state.seq, "Paused");
        }
        self.publish_progress(now);
        Ok(self.state.snapshot(now))
    }

    /// Resume playback. The song clock shifts forward by the paused time,
    /// so the remaining time is what it was when paused.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if nothing is playing.
    pub fn resume(&mut self) -> Result<PlaybackSnapshot, RadioError> {
        self.ensure_active("resume")?;
        let now = self.clock.now_millis();
        if let Some(paused_at) = self.state.paused_at.take() {
            self.state.start_time += now.saturating_sub(paused_at);
            self.state.seq += 1;
            debug!(seq = self.state.seq, "Resumed");
        }
        self.publish_progress(now);
        Ok(self.state.snapshot(now))
    }

    fn ensure_active(&self, command: &str) -> Result<(), RadioError> {
        if self.state.status() == Status::Stopped {
            return Err(RadioError::invalid(format!(
                "cannot {command}: no playlist is active"
            )));
        }
        Ok(())
    }

    async fn transition(&mut self, kind: Transition) {
        let len = self.state.queue.len();
        let index = match kind {
            Transition::Natural | Transition::Skip => (self.state.current_index + 1) % len,
            Transition::Previous => (self.state.current_index + len - 1) % len,
        };

        let now = self.clock.now_millis();
        self.state.restart_at(index, now);
        self.record_current_play().await;

        let (Some(current), Some(next)) = (self.state.current(), self.state.next()) else {
            return;
        };
        debug!(
            song = %current.id,
            index,
            transition = ?kind,
            seq = self.state.seq,
            "Song changed"
        );

        let change = SongChangePayload {
            seq: self.state.seq,
            current: current.clone(),
            next: next.clone(),
            queue: self.state.queue.clone(),
            current_index: index,
            remaining_ms: self.state.remaining_ms(now),
            start_time: self.state.start_time,
        };
        let queue_update = QueueUpdatePayload {
            seq: self.state.seq,
            queue: change.queue.clone(),
            current_index: index,
        };

        let payload = match kind {
            Transition::Natural => EventPayload::SongChange(change),
            Transition::Skip => EventPayload::Skip(change),
            Transition::Previous => EventPayload::Previous(change),
        };
        self.publish(payload, now);
        self.publish(EventPayload::QueueUpdate(queue_update), now);
    }

    /// Best effort: the transition already happened and stays, whatever the
    /// catalog says.
    async fn record_current_play(&mut self) {
        let Some(id) = self.state.current().map(|s| s.id.clone()) else {
            return;
        };
        if let Err(e) = self.catalog.record_play(&id).await {
            warn!(song = %id, error = %e, "Failed to record play");
            return;
        }
        match self.catalog.song(&id).await {
            Ok(song) => {
                if let Some(slot) = self.state.queue.get_mut(self.state.current_index) {
                    if slot.id == song.id {
                        *slot = song;
                    }
                }
            }
            Err(e) => warn!(song = %id, error = %e, "Failed to refresh song statistics"),
        }
    }

    fn publish_progress(&self, now: u64) {
        let Some(current) = self.state.current() else {
            return;
        };
        self.publish(
            EventPayload::PlaybackUpdate(PlaybackUpdatePayload {
                seq: self.state.seq,
                song_id: current.id.clone(),
                elapsed_ms: self.state.elapsed_ms(now),
                remaining_ms: self.state.remaining_ms(now),
                paused: self.state.is_paused(),
                server_time: now,
            }),
            now,
        );
    }

    fn publish(&self, payload: EventPayload, now: u64) {
        self.bus.publish(Event::new(payload, now));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::{handler_fn, EventHandler};
    use crate::catalog::{MemoryCatalog, Playlist};
    use crate::clock::ManualClock;
    use crate::error::HandlerError;
    use crate::event::EventKind;
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) const T0: u64 = 1_700_000_000_000;

    /// Records every event it sees.
    #[derive(Default)]
    pub(crate) struct Recorder {
        events: Mutex<Vec<Arc<Event>>>,
    }

    impl Recorder {
        pub(crate) fn attach(bus: &EventBus) -> Arc<Self> {
            let recorder = Arc::new(Self::default());
            let sink = Arc::clone(&recorder);
            let handler: Arc<dyn EventHandler> = Arc::new(handler_fn("recorder", move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.events.lock().unwrap().push(event);
                    Ok::<(), HandlerError>(())
                }
            }));
            bus.subscribe_all(handler);
            recorder
        }

        pub(crate) fn kinds(&self) -> Vec<EventKind> {
            let mut events: Vec<_> = self.events.lock().unwrap().clone();
            events.sort_by_key(|e| e.id);
            events.iter().map(|e| e.kind()).collect()
        }

        pub(crate) fn of_kind(&self, kind: EventKind) -> Vec<Arc<Event>> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.kind() == kind)
                .cloned()
                .collect()
        }

        pub(crate) fn clear(&self) {
            self.events.lock().unwrap().clear();
        }
    }

    pub(crate) fn song(id: &str, secs: u64) -> Song {
        Song::new(id, format!("Song {id}"), "Artist", Duration::from_secs(secs))
    }

    pub(crate) struct Fixture {
        pub(crate) timeline: Timeline,
        pub(crate) clock: Arc<ManualClock>,
        pub(crate) bus: Arc<EventBus>,
        pub(crate) catalog: Arc<MemoryCatalog>,
        pub(crate) recorder: Arc<Recorder>,
    }

    pub(crate) fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(T0));
        let catalog = Arc::new(MemoryCatalog::new(clock.clone()));
        for s in [song("s1", 180), song("s2", 200), song("s3", 240), song("solo", 90)] {
            catalog.insert_song(s);
        }
        catalog.insert_playlist(Playlist {
            id: "pair".into(),
            name: "Pair".into(),
            songs: vec!["s1".into(), "s2".into()],
        });
        catalog.insert_playlist(Playlist {
            id: "trio".into(),
            name: "Trio".into(),
            songs: vec!["s1".into(), "s2".into(), "s3".into(), "s1".into()],
        });
        catalog.insert_playlist(Playlist {
            id: "single".into(),
            name: "Single".into(),
            songs: vec!["solo".into()],
        });
        catalog.insert_playlist(Playlist {
            id: "empty".into(),
            name: "Empty".into(),
            songs: vec![],
        });
        catalog.insert_playlist(Playlist {
            id: "dangling".into(),
            name: "Dangling".into(),
            songs: vec!["ghost".into()],
        });

        let bus = Arc::new(EventBus::new());
        let recorder = Recorder::attach(&bus);
        let timeline = Timeline::new(catalog.clone(), Arc::clone(&bus), clock.clone());
        Fixture {
            timeline,
            clock,
            bus,
            catalog,
            recorder,
        }
    }

    fn assert_invariants(state: &PlaybackState, now: u64) {
        if !state.queue().is_empty() {
            assert!(state.current_index() < state.queue().len());
            let duration = state.current().unwrap().duration_ms;
            assert!(state.remaining_ms(now) <= duration);
        }
    }

    #[tokio::test]
    async fn test_new_timeline_is_stopped() {
        let mut f = fixture();
        assert_eq!(f.timeline.state().status(), Status::Stopped);
        assert_eq!(f.timeline.tick().await, TickOutcome::Idle);
        assert!(matches!(
            f.timeline.skip().await,
            Err(RadioError::InvalidInput(_))
        ));
        assert!(f.timeline.pause().is_err());
        assert!(f.timeline.resume().is_err());
        assert!(f.timeline.previous().await.is_err());

        let snapshot = f.timeline.snapshot();
        assert!(snapshot.current.is_none());
        assert!(snapshot.playlist.is_none());
    }

    #[tokio::test]
    async fn test_activate_playlist_publishes_playlist_change() {
        let mut f = fixture();
        let snapshot = f.timeline.activate_playlist("pair").await.unwrap();
        f.bus.idle().await;

        assert_eq!(snapshot.current_index, 0);
        assert_eq!(snapshot.start_time, T0);
        assert_eq!(snapshot.current.as_ref().unwrap().id, "s1");
        assert_eq!(snapshot.next.as_ref().unwrap().id, "s2");
        assert_eq!(snapshot.playlist.as_ref().unwrap().id, "pair");

        let changes = f.recorder.of_kind(EventKind::PlaylistChange);
        assert_eq!(changes.len(), 1);
        match &changes[0].payload {
            EventPayload::PlaylistChange(p) => {
                assert_eq!(p.current.id, "s1");
                assert_eq!(p.next.id, "s2");
                assert_eq!(p.state, snapshot);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_activation_drops_duplicate_songs() {
        let mut f = fixture();
        let snapshot = f.timeline.activate_playlist("trio").await.unwrap();
        let ids: Vec<_> = snapshot.queue.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s1", "s2", "s3"]);
    }

    #[tokio::test]
    async fn test_activate_empty_playlist_leaves_state_unchanged() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.clock.advance(Duration::from_secs(30));
        f.timeline.skip().await.unwrap();
        let before = f.timeline.snapshot();

        for id in ["empty", "dangling"] {
            assert!(matches!(
                f.timeline.activate_playlist(id).await,
                Err(RadioError::InvalidInput(_))
            ));
            assert_eq!(f.timeline.snapshot(), before);
        }

        assert!(matches!(
            f.timeline.activate_playlist("unknown").await,
            Err(RadioError::NotFound(_))
        ));
        assert_eq!(f.timeline.snapshot(), before);
    }

    #[tokio::test]
    async fn test_tick_advances_when_song_ends() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.bus.idle().await;
        f.recorder.clear();

        f.clock.advance(Duration::from_secs(180));
        assert_eq!(f.timeline.tick().await, TickOutcome::Advanced);
        f.bus.idle().await;

        let state = f.timeline.state();
        assert_eq!(state.current_index(), 1);
        assert_eq!(state.start_time(), T0 + 180_000);

        let changes = f.recorder.of_kind(EventKind::SongChange);
        assert_eq!(changes.len(), 1);
        match &changes[0].payload {
            EventPayload::SongChange(p) => {
                assert_eq!(p.current.id, "s2");
                assert_eq!(p.next.id, "s1");
                assert_eq!(p.remaining_ms, 200_000);
                assert_eq!(p.start_time, T0 + 180_000);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(f.recorder.of_kind(EventKind::QueueUpdate).len(), 1);
        assert!(f.recorder.of_kind(EventKind::PlaybackUpdate).is_empty());
    }

    #[tokio::test]
    async fn test_advance_records_play_statistics() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.clock.advance(Duration::from_secs(181));
        f.timeline.tick().await;

        let stored = f.catalog.song("s2").await.unwrap();
        assert_eq!(stored.play_count, 1);
        assert_eq!(f.timeline.state().current().unwrap().play_count, 1);
    }

    #[tokio::test]
    async fn test_tick_before_end_is_progress_only() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        let before = f.timeline.state().clone();

        for _ in 0..5 {
            f.clock.advance(Duration::from_secs(30));
            assert_eq!(f.timeline.tick().await, TickOutcome::Progress);
            let state = f.timeline.state();
            assert_eq!(state.current_index(), before.current_index());
            assert_eq!(state.start_time(), before.start_time());
            assert_eq!(state.seq(), before.seq());
        }
        f.bus.idle().await;

        let updates = f.recorder.of_kind(EventKind::PlaybackUpdate);
        assert_eq!(updates.len(), 5);
        let remaining: Vec<_> = updates
            .iter()
            .map(|e| match &e.payload {
                EventPayload::PlaybackUpdate(p) => p.remaining_ms,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert!(remaining.contains(&30_000));
    }

    #[tokio::test]
    async fn test_wrap_around_in_both_directions() {
        let mut f = fixture();
        f.timeline.activate_playlist("trio").await.unwrap();

        let snapshot = f.timeline.previous().await.unwrap();
        assert_eq!(snapshot.current_index, 2);

        let snapshot = f.timeline.skip().await.unwrap();
        assert_eq!(snapshot.current_index, 0);

        f.timeline.skip().await.unwrap();
        f.timeline.skip().await.unwrap();
        f.clock.advance(Duration::from_secs(240));
        assert_eq!(f.timeline.tick().await, TickOutcome::Advanced);
        assert_eq!(f.timeline.state().current_index(), 0);
        assert_invariants(f.timeline.state(), f.clock.now_millis());
    }

    #[tokio::test]
    async fn test_skip_on_single_song_restarts_it() {
        let mut f = fixture();
        f.timeline.activate_playlist("single").await.unwrap();
        f.bus.idle().await;
        f.recorder.clear();

        f.clock.advance(Duration::from_secs(40));
        let snapshot = f.timeline.skip().await.unwrap();
        f.bus.idle().await;

        assert_eq!(snapshot.current_index, 0);
        assert_eq!(snapshot.start_time, T0 + 40_000);
        assert_eq!(snapshot.remaining_ms, 90_000);
        assert_eq!(f.recorder.of_kind(EventKind::Skip).len(), 1);
        assert!(f.recorder.of_kind(EventKind::SongChange).is_empty());

        f.clock.advance(Duration::from_secs(5));
        let snapshot = f.timeline.previous().await.unwrap();
        assert_eq!(snapshot.current_index, 0);
        assert_eq!(snapshot.start_time, T0 + 45_000);
    }

    #[tokio::test]
    async fn test_previous_publishes_previous_event() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.bus.idle().await;
        f.recorder.clear();

        f.timeline.previous().await.unwrap();
        f.bus.idle().await;

        let kinds = f.recorder.kinds();
        assert_eq!(kinds, [EventKind::Previous, EventKind::QueueUpdate]);
    }

    #[tokio::test]
    async fn test_pause_resume_preserves_remaining() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.clock.advance(Duration::from_secs(50));

        for pause_secs in [0, 1, 17, 3_600] {
            let before = f.timeline.state().remaining_ms(f.clock.now_millis());
            let paused = f.timeline.pause().unwrap();
            assert!(paused.paused);
            assert_eq!(paused.remaining_ms, before);

            f.clock.advance(Duration::from_secs(pause_secs));
            assert_eq!(
                f.timeline.state().remaining_ms(f.clock.now_millis()),
                before
            );
            // A paused timeline never runs out.
            assert_eq!(f.timeline.tick().await, TickOutcome::Progress);

            let resumed = f.timeline.resume().unwrap();
            assert!(!resumed.paused);
            assert_eq!(resumed.remaining_ms, before);

            f.clock.advance(Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_idempotent() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();

        let seq = f.timeline.pause().unwrap().seq;
        assert_eq!(f.timeline.pause().unwrap().seq, seq);

        let seq = f.timeline.resume().unwrap().seq;
        assert_eq!(f.timeline.resume().unwrap().seq, seq);
    }

    #[tokio::test]
    async fn test_skip_while_paused_stays_paused_at_zero() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.clock.advance(Duration::from_secs(20));
        f.timeline.pause().unwrap();
        f.clock.advance(Duration::from_secs(20));

        let snapshot = f.timeline.skip().await.unwrap();
        assert!(snapshot.paused);
        assert_eq!(snapshot.elapsed_ms, 0);

        f.clock.advance(Duration::from_secs(100));
        let snapshot = f.timeline.resume().unwrap();
        assert_eq!(snapshot.elapsed_ms, 0);
        assert_eq!(snapshot.remaining_ms, 200_000);
    }

    #[tokio::test]
    async fn test_switching_playlists_does_not_record_partial_play() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.clock.advance(Duration::from_secs(60));
        f.timeline.activate_playlist("single").await.unwrap();

        assert_eq!(f.catalog.song("s1").await.unwrap().play_count, 0);
        assert_eq!(f.timeline.state().current().unwrap().id, "solo");
        assert_eq!(f.timeline.state().start_time(), T0 + 60_000);
    }

    #[tokio::test]
    async fn test_seq_strictly_increases_across_mutations() {
        let mut f = fixture();
        let mut last = f.timeline.state().seq();

        f.timeline.activate_playlist("trio").await.unwrap();
        assert!(f.timeline.state().seq() > last);
        last = f.timeline.state().seq();

        f.timeline.skip().await.unwrap();
        assert!(f.timeline.state().seq() > last);
        last = f.timeline.state().seq();

        f.timeline.pause().unwrap();
        assert!(f.timeline.state().seq() > last);
        last = f.timeline.state().seq();

        f.timeline.activate_playlist("pair").await.unwrap();
        assert!(f.timeline.state().seq() > last);
    }

    #[tokio::test]
    async fn test_activate_library_starts_with_least_played() {
        let mut f = fixture();
        f.catalog.record_play("s1").await.unwrap();

        let snapshot = f.timeline.activate_library(3).await.unwrap();
        let playlist = snapshot.playlist.unwrap();
        assert_eq!(playlist.id, LIBRARY_PLAYLIST_ID);
        assert!(snapshot.queue.len() <= 3);
        assert_ne!(snapshot.queue[0].id, "s1");

        let mut ids: Vec<_> = snapshot.queue.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), snapshot.queue.len());
    }

    #[tokio::test]
    async fn test_remaining_is_clamped_long_after_end() {
        let mut f = fixture();
        f.timeline.activate_playlist("pair").await.unwrap();
        f.clock.advance(Duration::from_secs(10_000));

        let state = f.timeline.state();
        assert_eq!(state.remaining_ms(f.clock.now_millis()), 0);
        assert_eq!(state.elapsed_ms(f.clock.now_millis()), 180_000);

        // Overdue by many songs, one tick still moves exactly one step.
        f.timeline.tick().await;
        assert_eq!(f.timeline.state().current_index(), 1);
        assert_invariants(f.timeline.state(), f.clock.now_millis());
    }
}
