//! Accepting endpoint: shared route registry, client table and broadcast.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{AcceptError, CallError};
use crate::execution::ExecutionStrategy;
use crate::pending::Role;
use crate::route::RouteRegistry;
use crate::serializer::Codec;
use crate::session::Session;
use crate::transport::Transport;

type AuthorizeFn =
    Arc<dyn Fn(Transport) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Server side of the protocol. Owns the registry every accepted session
/// resolves against and the uuid-keyed table of live sessions.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    registry: Arc<RouteRegistry>,
    clients: RwLock<HashMap<Uuid, Session>>,
    config: SessionConfig,
    strategy: ExecutionStrategy,
    codec: Codec,
    authorize: Mutex<Option<AuthorizeFn>>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::with(
            RouteRegistry::new(),
            SessionConfig::default(),
            ExecutionStrategy::Inline,
        )
    }

    pub fn with(
        registry: Arc<RouteRegistry>,
        config: SessionConfig,
        strategy: ExecutionStrategy,
    ) -> Self {
        Self::with_codec(registry, config, strategy, Codec::new())
    }

    /// Like [`Endpoint::with`], with a replaceable codec. Every accepted
    /// session encodes and decodes through it.
    pub fn with_codec(
        registry: Arc<RouteRegistry>,
        config: SessionConfig,
        strategy: ExecutionStrategy,
        codec: Codec,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                registry,
                clients: RwLock::new(HashMap::new()),
                config,
                strategy,
                codec,
                authorize: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.inner.registry
    }

    /// Install the authorize hook, consulted before any session exists.
    /// Returning `false` rejects the connection.
    pub fn set_authorize<F, Fut>(&self, hook: F)
    where
        F: Fn(Transport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let wrapped: AuthorizeFn = Arc::new(move |transport| Box::pin(hook(transport)));
        *self.inner.authorize.lock() = Some(wrapped);
    }

    /// Drive an inbound connection to an open session: authorize, register
    /// in the client table, start the read loop and keepalive.
    pub async fn accept(&self, transport: Transport) -> Result<Session, AcceptError> {
        let authorize = self.inner.authorize.lock().clone();
        if let Some(authorize) = authorize {
            if !authorize(transport.clone()).await {
                transport.close();
                tracing::debug!("connection rejected by authorize hook");
                return Err(AcceptError::Rejected);
            }
        }

        let session = Session::open_with_codec(
            transport,
            self.inner.registry.clone(),
            self.inner.config.clone(),
            self.inner.strategy,
            Role::Server,
            self.inner.codec.clone(),
        );
        self.inner
            .clients
            .write()
            .insert(session.id(), session.clone());

        // Deregistration must not keep the endpoint alive.
        let endpoint = Arc::downgrade(&self.inner);
        session.set_close_hook(Box::new(move |id| {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.clients.write().remove(&id);
            }
        }));

        tracing::debug!(session = %session.id(), "session accepted");
        Ok(session)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub fn clients(&self) -> Vec<Session> {
        self.inner.clients.read().values().cloned().collect()
    }

    pub fn client(&self, id: Uuid) -> Option<Session> {
        self.inner.clients.read().get(&id).cloned()
    }

    /// Call `method` on every connected session concurrently. One failing
    /// client never aborts the rest; its error travels alongside the other
    /// results. Zero clients yield an empty vec.
    pub async fn broadcast(&self, method: &str, params: Value) -> Vec<Result<Value, CallError>> {
        let sessions = self.clients();
        join_all(
            sessions
                .iter()
                .map(|session| session.call(method, params.clone())),
        )
        .await
    }

    /// Close every session and wait for their teardown.
    pub async fn close_all(&self) {
        let sessions = self.clients();
        for session in &sessions {
            session.close();
        }
        for session in &sessions {
            session.wait_closed().await;
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}
