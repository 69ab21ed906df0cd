//! The radio actor.
//!
//! A single task owns the [`Timeline`]. The playback clock, HTTP commands
//! and WebSocket sync requests all reach it through one bounded command
//! queue, so mutations are applied strictly one after another. Readers that
//! only need the latest state use the watch channel and never queue.

use crate::error::RadioError;
use crate::reaction::ReactionRelay;
use crate::timeline::Timeline;
use airwave_protocol::{PlaybackSnapshot, ReactionPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Radio configuration.
#[derive(Debug, Clone)]
pub struct RadioConfig {
    /// Interval between timeline ticks.
    pub tick_interval: Duration,
    /// Capacity of the command queue.
    pub command_capacity: usize,
    /// Length of the auto-generated library queue.
    pub library_queue_len: usize,
    /// Playlist to activate on start. The library queue is used when unset.
    pub initial_playlist: Option<String>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            command_capacity: 64,
            library_queue_len: 50,
            initial_playlist: None,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, RadioError>>;

enum Command {
    ActivatePlaylist {
        id: String,
        reply: Reply<PlaybackSnapshot>,
    },
    ActivateLibrary {
        reply: Reply<PlaybackSnapshot>,
    },
    Skip {
        reply: Reply<PlaybackSnapshot>,
    },
    Previous {
        reply: Reply<PlaybackSnapshot>,
    },
    Pause {
        reply: Reply<PlaybackSnapshot>,
    },
    Resume {
        reply: Reply<PlaybackSnapshot>,
    },
    Snapshot {
        reply: Reply<PlaybackSnapshot>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::ActivatePlaylist { .. } => "activate_playlist",
            Command::ActivateLibrary { .. } => "activate_library",
            Command::Skip { .. } => "skip",
            Command::Previous { .. } => "previous",
            Command::Pause { .. } => "pause",
            Command::Resume { .. } => "resume",
            Command::Snapshot { .. } => "snapshot",
        }
    }
}

/// The task that owns the timeline.
pub struct Radio {
    timeline: Timeline,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<Arc<PlaybackSnapshot>>,
    config: RadioConfig,
    shutdown: CancellationToken,
}

impl Radio {
    /// Start the actor. It runs until `shutdown` is cancelled or every
    /// handle is dropped.
    pub fn spawn(
        timeline: Timeline,
        relay: ReactionRelay,
        config: RadioConfig,
        shutdown: CancellationToken,
    ) -> (RadioHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let (state, state_rx) = watch::channel(Arc::new(timeline.snapshot()));

        let radio = Radio {
            timeline,
            commands: rx,
            state,
            config,
            shutdown,
        };
        let task = tokio::spawn(radio.run());

        let handle = RadioHandle {
            commands: tx,
            state: state_rx,
            relay,
        };
        (handle, task)
    }

    async fn run(mut self) {
        self.start().await;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Radio shutdown requested");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All radio handles dropped");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.timeline.tick().await;
                }
            }
            self.state.send_replace(Arc::new(self.timeline.snapshot()));
        }

        info!("Radio stopped");
    }

    async fn start(&mut self) {
        let result = match self.config.initial_playlist.clone() {
            Some(id) => self.timeline.activate_playlist(&id).await,
            None => {
                self.timeline
                    .activate_library(self.config.library_queue_len)
                    .await
            }
        };
        match result {
            Ok(snapshot) => {
                self.state.send_replace(Arc::new(snapshot));
                info!(
                    playlist = ?self.timeline.state().playlist().map(|p| &p.id),
                    "Radio started"
                );
            }
            Err(e) => warn!(error = %e, "Radio started without a playlist"),
        }
    }

    async fn handle(&mut self, command: Command) {
        debug!(command = command.name(), "Radio command");
        match command {
            Command::ActivatePlaylist { id, reply } => {
                let result = self.timeline.activate_playlist(&id).await;
                let _ = reply.send(result);
            }
            Command::ActivateLibrary { reply } => {
                let result = self
                    .timeline
                    .activate_library(self.config.library_queue_len)
                    .await;
                let _ = reply.send(result);
            }
            Command::Skip { reply } => {
                let _ = reply.send(self.timeline.skip().await);
            }
            Command::Previous { reply } => {
                let _ = reply.send(self.timeline.previous().await);
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.timeline.pause());
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.timeline.resume());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.timeline.snapshot()));
            }
        }
    }
}

/// Cloneable front door to the radio.
#[derive(Clone)]
pub struct RadioHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<Arc<PlaybackSnapshot>>,
    relay: ReactionRelay,
}

impl RadioHandle {
    async fn request(
        &self,
        make: impl FnOnce(Reply<PlaybackSnapshot>) -> Command,
    ) -> Result<PlaybackSnapshot, RadioError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| RadioError::Closed)?;
        rx.await.map_err(|_| RadioError::Closed)?
    }

    pub async fn activate_playlist(&self, id: &str) -> Result<PlaybackSnapshot, RadioError> {
        let id = id.to_string();
        self.request(|reply| Command::ActivatePlaylist { id, reply })
            .await
    }

    pub async fn activate_library(&self) -> Result<PlaybackSnapshot, RadioError> {
        self.request(|reply| Command::ActivateLibrary { reply }).await
    }

    pub async fn skip(&self) -> Result<PlaybackSnapshot, RadioError> {
        self.request(|reply| Command::Skip { reply }).await
    }

    pub async fn previous(&self) -> Result<PlaybackSnapshot, RadioError> {
        self.request(|reply| Command::Previous { reply }).await
    }

    pub async fn pause(&self) -> Result<PlaybackSnapshot, RadioError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<PlaybackSnapshot, RadioError> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Snapshot taken by the actor now, with a fresh `server_time`.
    pub async fn snapshot(&self) -> Result<PlaybackSnapshot, RadioError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// The last snapshot the actor published. Never waits on the queue.
    #[must_use]
    pub fn latest(&self) -> Arc<PlaybackSnapshot> {
        Arc::clone(&self.state.borrow())
    }

    /// Watch for state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<PlaybackSnapshot>> {
        self.state.clone()
    }

    /// Relay a listener reaction. Does not go through the actor.
    pub fn submit_reaction(
        &self,
        user_id: &str,
        emote: &str,
    ) -> Result<ReactionPayload, RadioError> {
        self.relay.submit(user_id, emote)
    }

    /// Whether the actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
