//! Dialing side of the protocol.
//!
//! A client owns one outbound session with odd identifier parity and its own
//! registry, which the server calls into for the reverse direction.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::CallError;
use crate::execution::ExecutionStrategy;
use crate::pending::Role;
use crate::route::RouteRegistry;
use crate::serializer::Codec;
use crate::session::{Proxy, Session};
use crate::transport::Transport;

pub struct Client {
    session: Session,
}

impl Client {
    /// Attach to an already-established transport with default
    /// configuration.
    pub fn new(transport: Transport) -> Client {
        Self::with(
            transport,
            RouteRegistry::new(),
            SessionConfig::default(),
            ExecutionStrategy::Inline,
        )
    }

    pub fn with(
        transport: Transport,
        registry: Arc<RouteRegistry>,
        config: SessionConfig,
        strategy: ExecutionStrategy,
    ) -> Client {
        Self::with_codec(transport, registry, config, strategy, Codec::new())
    }

    /// Like [`Client::with`], with a replaceable codec for the session's
    /// encode and decode hooks.
    pub fn with_codec(
        transport: Transport,
        registry: Arc<RouteRegistry>,
        config: SessionConfig,
        strategy: ExecutionStrategy,
        codec: Codec,
    ) -> Client {
        let session =
            Session::open_with_codec(transport, registry, config, strategy, Role::Client, codec);
        Client { session }
    }

    /// Dial a WebSocket URL.
    #[cfg(feature = "websocket")]
    pub async fn connect(url: &str) -> Result<Client, crate::error::TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(crate::transport::websocket::ws_error)?;
        Ok(Self::new(Transport::websocket(ws)))
    }

    #[cfg(feature = "websocket")]
    pub async fn connect_with(
        url: &str,
        registry: Arc<RouteRegistry>,
        config: SessionConfig,
        strategy: ExecutionStrategy,
    ) -> Result<Client, crate::error::TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(crate::transport::websocket::ws_error)?;
        Ok(Self::with(Transport::websocket(ws), registry, config, strategy))
    }

    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Registry the server's reverse-direction calls resolve against.
    pub fn registry(&self) -> &Arc<RouteRegistry> {
        self.session.registry()
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.session.call(method, params).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.session.call_with_timeout(method, params, timeout).await
    }

    pub fn proxy(&self) -> Proxy {
        self.session.proxy()
    }

    pub async fn emit(&self, event: Value) -> Result<(), CallError> {
        self.session.emit(event).await
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .finish()
    }
}
