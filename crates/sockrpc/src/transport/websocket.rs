//! WebSocket transport over tokio-tungstenite.
//!
//! The socket is split into sink and stream halves, each behind its own
//! async mutex: the send path is serialized per connection, so outbound
//! frame writes are atomic. Ping and pong frames are handled by tungstenite
//! itself and skipped here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::StreamExt;
use futures::{Sink, SinkExt, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::TransportError;
use crate::transport::{TransportBackend, WireFrame};

type WsSink = Box<dyn Sink<Message, Error = WsError> + Send + Unpin>;
type WsStream = Box<dyn Stream<Item = Result<Message, WsError>> + Send + Unpin>;

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    sink: tokio::sync::Mutex<WsSink>,
    stream: tokio::sync::Mutex<WsStream>,
    closed: AtomicBool,
}

impl WebSocketTransport {
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            inner: Arc::new(WsInner {
                sink: tokio::sync::Mutex::new(Box::new(sink)),
                stream: tokio::sync::Mutex::new(Box::new(stream)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A connected pair over an in-memory duplex stream, with a real
    /// client/server handshake on both ends.
    pub async fn pair() -> Result<(Self, Self), TransportError> {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let client = tokio_tungstenite::client_async("ws://localhost/", client_io);
        let server = tokio_tungstenite::accept_async(server_io);
        let (client, server) = tokio::try_join!(
            async { client.await.map_err(ws_error) },
            async { server.await.map_err(ws_error) },
        )?;
        let (client, _response) = client;
        Ok((Self::new(client), Self::new(server)))
    }
}

pub(crate) fn ws_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => TransportError::Io(e),
        other => TransportError::Handshake(other.to_string()),
    }
}

impl TransportBackend for WebSocketTransport {
    async fn send_frame(&self, frame: WireFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text.into()),
            WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        let mut sink = self.inner.sink.lock().await;
        sink.send(message).await.map_err(ws_error)
    }

    async fn recv_frame(&self) -> Result<WireFrame, TransportError> {
        let mut stream = self.inner.stream.lock().await;
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(WireFrame::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(WireFrame::Binary(bytes.to_vec()));
                }
                // Control traffic; tungstenite replies to pings on its own.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.close();
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => {
                    self.close();
                    return Err(ws_error(e));
                }
            }
        }
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drive the close handshake so the peer sees a Close frame instead
        // of a vanished connection. Outside a runtime the sink is simply
        // dropped, which tears the stream down without the handshake.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                let mut sink = inner.sink.lock().await;
                if let Err(e) = sink.close().await {
                    tracing::debug!(error = %ws_error(e), "close handshake failed");
                }
            });
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.is_closed())
            .finish()
    }
}
