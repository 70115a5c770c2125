//! User transport boundary.
//!
//! The session core never owns connection upgrade or read loops — it
//! only writes. [`UserConnection`] is the write-side capability handed
//! to the broadcaster; [`WsConnection`] adapts an established
//! tokio-tungstenite socket, and [`ChannelConnection`] is the
//! channel-backed double the test suites (and local tooling) attach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::Message;

/// Write-side handle to one user's live connection.
#[async_trait]
pub trait UserConnection: Send + Sync {
    /// Deliver one envelope. Failures affect only this delivery.
    async fn send(&self, msg: &Message) -> Result<(), TransportError>;

    /// Close the underlying transport.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Transport write failures.
#[derive(Debug, Clone)]
pub enum TransportError {
    Encoding(String),
    Write(String),
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encoding(e) => write!(f, "message encoding failed: {e}"),
            Self::Write(e) => write!(f, "transport write failed: {e}"),
            Self::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Adapter over the write half of an established WebSocket. Envelopes
/// go out as JSON text frames; the sink mutex keeps frame writes whole
/// even though the broadcaster is the only expected writer.
pub struct WsConnection<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(sink: SplitSink<WebSocketStream<S>, WsMessage>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl<S> UserConnection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let raw = msg
            .encode()
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(raw.into()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        // Best-effort close frame; the sink close is what matters.
        let _ = sink.send(WsMessage::Close(None)).await;
        sink.close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

/// Channel-backed [`UserConnection`] double: delivered envelopes land in
/// the paired receiver.
pub struct ChannelConnection {
    tx: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl ChannelConnection {
    /// Create a connection plus the receiver observing its deliveries.
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserConnection for ChannelConnection {
    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(msg.clone())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
