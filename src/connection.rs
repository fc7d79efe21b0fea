//! One authorized WebSocket session and its read/write pumps.
//!
//! The read pump turns inbound frames into PTY operations. The write pump
//! drains the outbound queue the hub fills and keeps the peer alive with
//! pings. The two pumps share nothing but the hub and a per-connection
//! `closed` token that stands in for closing the transport.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::RequestContext;
use crate::hub::{ConnectionId, Hub, Registration, OUTBOUND_CAPACITY};
use crate::pty::{PtyError, PtyWriter};

/// Separator placed between payloads coalesced into one outbound frame.
pub const BATCH_DELIMITER: u8 = b'\n';

/// Timing and size limits for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Deadline for each write to the peer, in milliseconds.
    pub write_wait_ms: u64,
    /// How long the peer may stay silent (no pong) before it is dropped.
    pub pong_wait_ms: u64,
    /// Interval between pings. Must be shorter than `pong_wait_ms`.
    pub ping_period_ms: u64,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Payloads buffered per connection before it counts as saturated.
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            ping_period_ms: 54_000,
            max_message_size: 32 * 1024,
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// A decoded inbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
    Kill,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    cols: u32,
    #[serde(default)]
    rows: u32,
}

fn clamp_dimension(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

impl ControlMessage {
    /// Decode a frame. Frames that are not a JSON object with a non-empty
    /// `type` are treated as raw terminal input.
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let wire = match serde_json::from_slice::<WireMessage>(frame) {
            Ok(wire) if !wire.kind.is_empty() => wire,
            _ => return Ok(Self::Input(Bytes::copy_from_slice(frame))),
        };
        match wire.kind.as_str() {
            "input" => Ok(Self::Input(Bytes::from(wire.data))),
            "resize" => Ok(Self::Resize {
                cols: clamp_dimension(wire.cols),
                rows: clamp_dimension(wire.rows),
            }),
            "kill" => Ok(Self::Kill),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Why a pump stopped. Only used for logging.
#[derive(Debug, Error)]
enum PumpExit {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("connection closed locally")]
    Closed,
    #[error("no pong within {0:?}")]
    PongTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(axum::Error),
    #[error("write timed out")]
    WriteTimeout,
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
    #[error("pty error: {0}")]
    Pty(PtyError),
    #[error("removed from hub")]
    Removed,
    #[error("hub stopped")]
    HubStopped,
}

/// An admitted connection, ready to run its pumps.
pub struct Connection {
    id: ConnectionId,
    session_id: String,
    context: RequestContext,
    pty: Arc<dyn PtyWriter>,
    hub: Hub,
    config: ConnectionConfig,
    closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.context.user_id())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        session_id: impl Into<String>,
        context: RequestContext,
        pty: Arc<dyn PtyWriter>,
        hub: Hub,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            id,
            session_id: session_id.into(),
            context,
            pty,
            hub,
            config,
            closed: CancellationToken::new(),
        }
    }

    /// Spawn the read and write pumps over a split transport.
    ///
    /// `outbound` must be the receiver returned by [`Hub::register`] for
    /// this connection's id.
    pub fn start<R, W>(
        self,
        reader: R,
        writer: W,
        outbound: mpsc::Receiver<Bytes>,
    ) -> (JoinHandle<()>, JoinHandle<()>)
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
        W: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    {
        let conn = Arc::new(self);
        let write = tokio::spawn(conn.clone().write_pump(writer, outbound));
        let read = tokio::spawn(conn.read_pump(reader));
        (read, write)
    }

    /// Convenience for [`Connection::start`] with a fresh [`Registration`].
    pub fn start_registered<R, W>(
        self,
        reader: R,
        writer: W,
        registration: Registration,
    ) -> (JoinHandle<()>, JoinHandle<()>)
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
        W: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    {
        debug_assert_eq!(self.id, registration.id);
        self.start(reader, writer, registration.outbound)
    }

    fn forward(&self, message: ControlMessage) -> Result<(), PtyError> {
        match message {
            ControlMessage::Input(data) => self.pty.write_pty(&self.session_id, &data),
            ControlMessage::Resize { cols, rows } => {
                self.pty.resize_pty(&self.session_id, cols, rows)
            }
            ControlMessage::Kill => self.pty.kill_pty(&self.session_id),
        }
    }

    async fn read_pump<R>(self: Arc<Self>, mut reader: R)
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let pong_wait = self.config.pong_wait();
        let mut deadline = Instant::now() + pong_wait;

        let exit = loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break PumpExit::Closed,
                next = tokio::time::timeout_at(deadline, reader.next()) => next,
            };
            let message = match next {
                Err(_) => break PumpExit::PongTimeout(pong_wait),
                Ok(None) => break PumpExit::PeerClosed,
                Ok(Some(Err(e))) => break PumpExit::Transport(e),
                Ok(Some(Ok(message))) => message,
            };
            let frame = match message {
                Message::Pong(_) => {
                    deadline = Instant::now() + pong_wait;
                    continue;
                }
                Message::Ping(_) => continue,
                Message::Close(_) => break PumpExit::PeerClosed,
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Binary(data) => data,
            };
            if frame.len() > self.config.max_message_size {
                break PumpExit::Protocol(ProtocolError::TooLarge {
                    size: frame.len(),
                    limit: self.config.max_message_size,
                });
            }
            let message = match ControlMessage::parse(&frame) {
                Ok(message) => message,
                Err(e) => break PumpExit::Protocol(e),
            };
            if let Err(e) = self.forward(message) {
                break PumpExit::Pty(e);
            }
        };

        match &exit {
            PumpExit::PeerClosed | PumpExit::Closed => {
                tracing::debug!(connection = %self.id, session = %self.session_id, "read pump finished: {exit}")
            }
            _ => {
                tracing::info!(connection = %self.id, session = %self.session_id, "read pump finished: {exit}")
            }
        }

        self.hub.unregister(self.id).await;
        self.closed.cancel();
    }

    async fn write_pump<W>(self: Arc<Self>, mut writer: W, mut outbound: mpsc::Receiver<Bytes>)
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let write_wait = self.config.write_wait();
        let ping_period = self.config.ping_period();
        let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

        let exit = loop {
            tokio::select! {
                _ = self.hub.stopped() => break PumpExit::HubStopped,
                _ = self.closed.cancelled() => break PumpExit::Closed,
                _ = ticker.tick() => {
                    if let Err(e) = send_within(&mut writer, Message::Ping(Bytes::new()), write_wait).await {
                        break e;
                    }
                }
                payload = outbound.recv() => match payload {
                    Some(first) => {
                        let frame = coalesce(first, &mut outbound);
                        if let Err(e) = send_within(&mut writer, Message::Binary(frame), write_wait).await {
                            break e;
                        }
                    }
                    None => {
                        let _ = send_within(&mut writer, Message::Close(None), write_wait).await;
                        break PumpExit::Removed;
                    }
                },
            }
        };

        tracing::debug!(connection = %self.id, session = %self.session_id, "write pump finished: {exit}");
        let _ = tokio::time::timeout(write_wait, writer.close()).await;
        self.closed.cancel();
    }
}

async fn send_within<W>(writer: &mut W, message: Message, wait: Duration) -> Result<(), PumpExit>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    match tokio::time::timeout(wait, writer.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PumpExit::Transport(e)),
        Err(_) => Err(PumpExit::WriteTimeout),
    }
}

/// Join `first` with every payload already waiting in `outbound`.
fn coalesce(first: Bytes, outbound: &mut mpsc::Receiver<Bytes>) -> Bytes {
    let mut rest = Vec::new();
    while let Ok(next) = outbound.try_recv() {
        rest.push(next);
    }
    if rest.is_empty() {
        return first;
    }

    let size = first.len() + rest.iter().map(|p| p.len() + 1).sum::<usize>();
    let mut frame = BytesMut::with_capacity(size);
    frame.extend_from_slice(&first);
    for payload in rest {
        frame.put_u8(BATCH_DELIMITER);
        frame.extend_from_slice(&payload);
    }
    frame.freeze()
}
