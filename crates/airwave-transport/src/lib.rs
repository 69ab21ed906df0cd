//! # airwave-transport
//!
//! Listener connections and broadcast fan-out for the Airwave radio engine.
//!
//! - **Connection** - The write half of one listener, owned by a writer task
//! - **Broadcaster** - Pushes every bus event to every live connection
//! - **WebSocket** - axum WebSocket connections, JSON or MessagePack
//!
//! ```rust,ignore
//! use airwave_transport::{websocket, Broadcaster};
//!
//! let broadcaster = Broadcaster::new();
//! broadcaster.attach(&bus);
//!
//! let (sink, mut source) = websocket::split(socket, &config, None);
//! let id = broadcaster.register(sink, Some(ServerFrame::State(snapshot)))?;
//! while let Some(frame) = source.recv().await? {
//!     // Handle client frame
//! }
//! ```

pub mod fanout;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use fanout::{Broadcaster, FanoutConfig, FanoutStats};
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketSink, WebSocketSource};
