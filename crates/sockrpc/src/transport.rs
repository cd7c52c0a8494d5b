//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and implements the internal [`TransportBackend`]
//! trait. The in-memory backend is always available and serves as the
//! semantic reference; the WebSocket backend sits behind the `websocket`
//! feature.

use crate::error::TransportError;

/// One message on the wire. Text frames carry protocol payloads; binary
/// frames are handed to the session's binary hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    async fn send_frame(&self, frame: WireFrame) -> Result<(), TransportError>;
    async fn recv_frame(&self) -> Result<WireFrame, TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub enum Transport {
    Mem(mem::MemTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WebSocketTransport),
}

impl Transport {
    pub async fn send_frame(&self, frame: WireFrame) -> Result<(), TransportError> {
        match self {
            Transport::Mem(t) => t.send_frame(frame).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.send_frame(frame).await,
        }
    }

    pub async fn recv_frame(&self) -> Result<WireFrame, TransportError> {
        match self {
            Transport::Mem(t) => t.recv_frame().await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.recv_frame().await,
        }
    }

    pub fn close(&self) {
        match self {
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.is_closed(),
        }
    }

    /// A connected in-memory pair. Frames sent on one end arrive on the
    /// other.
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    #[cfg(feature = "websocket")]
    pub fn websocket<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Transport::WebSocket(websocket::WebSocketTransport::new(ws))
    }

    /// A connected WebSocket pair over an in-memory duplex stream, with a
    /// real client/server handshake.
    #[cfg(feature = "websocket")]
    pub async fn websocket_pair() -> Result<(Self, Self), TransportError> {
        let (a, b) = websocket::WebSocketTransport::pair().await?;
        Ok((Transport::WebSocket(a), Transport::WebSocket(b)))
    }
}

pub mod mem;
#[cfg(feature = "websocket")]
pub mod websocket;
