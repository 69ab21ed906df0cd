//! # airwave-core
//!
//! Playback timeline, event bus and reaction relay for the Airwave shared
//! radio engine.
//!
//! - **Timeline** - The single authoritative "now playing" state machine
//! - **Radio** - Actor task owning the timeline, fed by one command queue
//! - **EventBus** - Fire-and-forget pub/sub with per-handler isolation
//! - **ReactionRelay** - Turns listener emotes into bus events
//! - **Catalog** - Song and playlist storage contract
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ RadioHandle │────▶│    Radio    │────▶│  Timeline   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────┐                        ┌─────────────┐
//! │  Reactions  │───────────────────────▶│  EventBus   │───▶ handlers
//! └─────────────┘                        └─────────────┘
//! ```

pub mod bus;
pub mod catalog;
pub mod clock;
pub mod error;
pub mod event;
pub mod radio;
pub mod reaction;
pub mod timeline;

pub use bus::{handler_fn, BusConfig, BusStats, EventBus, EventHandler, SubscriptionId};
pub use catalog::{Catalog, Library, LibrarySong, MemoryCatalog, Playlist};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{HandlerError, RadioError};
pub use event::{Event, EventKind, EventPayload};
pub use radio::{Radio, RadioConfig, RadioHandle};
pub use reaction::ReactionRelay;
pub use timeline::{PlaybackState, Status, TickOutcome, Timeline};
