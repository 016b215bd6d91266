//! Message-oriented duplex transport carrying the tunneled circuit
//!
//! The circuit only needs discrete frames in both directions plus an open/close
//! signal. `WebSocketTransport` provides that over `tokio-tungstenite`; tests plug
//! in their own `Transport` implementations.

use crate::networking::{NetworkError, NetworkResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Close codes used by the circuit
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    /// Close frame without a status code
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const POLICY_VIOLATION: u16 = 1008;
    /// No inbound traffic for too long
    pub const LIVENESS_TIMEOUT: u16 = 4000;
}

/// One transport-level message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Events a connection reports back to the circuit driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Frame),
    Closed { code: u16, reason: String },
}

/// Writing half of an open connection
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: Frame) -> NetworkResult<()>;

    async fn close(&mut self, code: u16, reason: &str) -> NetworkResult<()>;
}

/// Factory for connections; called again for every reconnect
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a fresh connection. Inbound frames and the final close are
    /// reported on `events`.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> NetworkResult<Box<dyn TransportSink>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket tunnel endpoint
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> NetworkResult<Box<dyn TransportSink>> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| NetworkError::Transport {
                reason: format!("Failed to connect to {}: {}", self.url, e),
            })?;
        info!("WebSocket tunnel connected to {}", self.url);

        let (sink, mut stream) = stream.split();
        let reader = tokio::spawn(async move {
            let closed = loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = events.send(TransportEvent::Message(Frame::Binary(data)));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(Frame::Text(text.as_str().to_owned())));
                    }
                    Some(Ok(Message::Close(frame))) => break close_event(frame),
                    Some(Ok(_)) => continue, // ping/pong/raw frames
                    Some(Err(e)) => {
                        warn!("WebSocket receive failed: {}", e);
                        break TransportEvent::Closed {
                            code: close_code::ABNORMAL,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break TransportEvent::Closed {
                            code: close_code::ABNORMAL,
                            reason: "stream ended".to_string(),
                        }
                    }
                }
            };
            debug!("WebSocket reader finished: {:?}", closed);
            let _ = events.send(closed);
        });

        Ok(Box::new(WebSocketSink { sink, reader }))
    }
}

/// Maps a received close frame to the event the circuit sees.
///
/// A frame without a status reports 1005, which the circuit treats like any
/// other non-policy close and reconnects.
fn close_event(frame: Option<CloseFrame>) -> TransportEvent {
    match frame {
        Some(frame) => TransportEvent::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned(),
        },
        None => TransportEvent::Closed {
            code: close_code::NO_STATUS,
            reason: "closed without status".to_string(),
        },
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
    /// Reader task of this connection; stopped when the sink goes away
    reader: JoinHandle<()>,
}

impl Drop for WebSocketSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> NetworkResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.sink.send(message).await.map_err(|e| NetworkError::Transport {
            reason: format!("WebSocket send failed: {}", e),
        })
    }

    async fn close(&mut self, code: u16, reason: &str) -> NetworkResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let result = self
            .sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| NetworkError::Transport {
                reason: format!("WebSocket close failed: {}", e),
            });
        self.reader.abort();
        result
    }
}
