//! WebSocket transport implementation.
//!
//! An upgraded axum [`WebSocket`] is split in two: the [`WebSocketSink`] is
//! handed to the broadcaster, the [`WebSocketSource`] stays with the request
//! handler that reads client frames. Text messages carry JSON, binary
//! messages carry length-prefixed MessagePack.

use crate::traits::{Connection, ConnectionId, TransportError};
use airwave_protocol::{codec, ClientFrame, Encoding, ProtocolError, ServerFrame};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, trace, warn};

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Encoding for outbound frames.
    pub encoding: Encoding,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
            encoding: Encoding::Json,
        }
    }
}

/// Split an upgraded socket into its writer and reader halves.
#[must_use]
pub fn split(
    socket: WebSocket,
    config: &WebSocketConfig,
    remote_addr: Option<String>,
) -> (WebSocketSink, WebSocketSource) {
    let id = ConnectionId::generate();
    let (sink, stream) = socket.split();
    (
        WebSocketSink {
            id: id.clone(),
            sink,
            encoding: config.encoding,
            remote_addr,
        },
        WebSocketSource {
            id,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: config.max_message_size,
        },
    )
}

/// Encode a frame as a WebSocket message.
///
/// # Errors
///
/// Returns an error if the frame cannot be serialized.
pub fn to_message(frame: &ServerFrame, encoding: Encoding) -> Result<Message, ProtocolError> {
    Ok(match encoding {
        Encoding::Json => Message::Text(codec::encode_json(frame)?),
        Encoding::Msgpack => Message::Binary(codec::encode(frame)?.to_vec()),
    })
}

/// Outbound half of a WebSocket connection.
pub struct WebSocketSink {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
    encoding: Encoding,
    remote_addr: Option<String>,
}

#[async_trait]
impl Connection for WebSocketSink {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let message = to_message(frame, self.encoding)?;
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Best effort: the peer may already be gone.
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// Inbound half of a WebSocket connection.
pub struct WebSocketSource {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketSource {
    /// The connection this half belongs to.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Receive the next client frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection. A
    /// `Protocol` error means one malformed frame; the connection is still
    /// usable.
    ///
    /// # Errors
    ///
    /// `Protocol` for an undecodable or oversized frame, `ReceiveFailed` if
    /// the socket broke.
    pub async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError> {
        // First, try to decode from the existing buffer
        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        warn!(connection = %self.id, size = text.len(), "Message too large");
                        return Err(ProtocolError::FrameTooLarge(text.len()).into());
                    }
                    trace!(connection = %self.id, "Text frame");
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(connection = %self.id, size = data.len(), "Message too large");
                        return Err(ProtocolError::FrameTooLarge(data.len()).into());
                    }
                    self.read_buffer.extend_from_slice(&data);

                    match codec::decode_from(&mut self.read_buffer) {
                        Ok(Some(frame)) => return Ok(Some(frame)),
                        Ok(None) => {} // Need more data
                        Err(e) => {
                            self.read_buffer.clear();
                            return Err(e.into());
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Pings are answered by the WebSocket layer
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
