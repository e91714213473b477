use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::trace;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Connects a session to the remote authority. The production implementation
/// is [`WsTransport`]; tests script an in-memory one to drive the reconnect
/// state machine deterministically.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Sink: FrameSink;
    type Stream: FrameStream;

    /// Open a transport to `url` and complete its handshake.
    async fn connect(&self, url: &str) -> Result<(Self::Sink, Self::Stream), TransportError>;
}

/// Outbound half of an established connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Inbound half of an established connection. `None` means the peer closed
/// the connection.
#[async_trait]
pub trait FrameStream: Send {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

type WsStreamInner = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport speaking binary frames.
pub struct WsTransport;

pub struct WsSink {
    inner: SplitSink<WsStreamInner, Message>,
}

pub struct WsStream {
    inner: SplitStream<WsStreamInner>,
}

#[async_trait]
impl Transport for WsTransport {
    type Sink = WsSink;
    type Stream = WsStream;

    async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((WsSink { inner: sink }, WsStream { inner: stream }))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.inner
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            return match self.inner.next().await? {
                Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
                Ok(Message::Close(_)) => None,
                Ok(other) => {
                    // text and ping/pong frames are not part of the protocol
                    trace!(kind = ?other, "skipping non-binary frame");
                    continue;
                }
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            };
        }
    }
}
