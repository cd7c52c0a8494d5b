//! The session engine: one connection, its demux loop, dispatcher and
//! lifecycle.
//!
//! A [`Session`] is a cheap-clone handle. The run loop is the only caller of
//! `transport.recv_frame()`; frames are read strictly in arrival order and
//! handled concurrently on spawned dispatch tasks, except inbound calls
//! sharing an identifier, which serialize on a per-identifier lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{CallError, HandlerError, RemoteError};
use crate::execution::ExecutionStrategy;
use crate::message::{call_payload, error_payload, result_payload, Args, ErrorFrame, Inbound};
use crate::pending::{LockTable, Outcome, PendingCalls, PendingGuard, Role, SerialAllocator};
use crate::route::{Resolved, RouteInstance, RouteRegistry};
use crate::serializer::Codec;
use crate::transport::{Transport, WireFrame};

type ListenerFn = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
type BinaryFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
type CloseHook = Box<dyn FnOnce(Uuid) + Send>;

/// Handle to a registered event listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Handle to one live connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    role: Role,
    transport: Transport,
    codec: Codec,
    registry: Arc<RouteRegistry>,
    config: SessionConfig,
    strategy: ExecutionStrategy,
    serial: SerialAllocator,
    pending: PendingCalls,
    locks: LockTable,
    instances: Mutex<HashMap<String, Arc<dyn RouteInstance>>>,
    listeners: Mutex<HashMap<u64, ListenerFn>>,
    listener_serial: AtomicU64,
    binary_handler: Mutex<Option<BinaryFn>>,
    close_hook: Mutex<Option<CloseHook>>,
    admission: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    /// Cancelled once `finalize` has completely torn the session down.
    done: CancellationToken,
    closed: AtomicBool,
    started: Instant,
}

impl Session {
    /// Open a session over `transport` and start its run loop. Accepting
    /// sides additionally run the keepalive task.
    pub fn open(
        transport: Transport,
        registry: Arc<RouteRegistry>,
        config: SessionConfig,
        strategy: ExecutionStrategy,
        role: Role,
    ) -> Session {
        Self::open_with_codec(transport, registry, config, strategy, role, Codec::new())
    }

    pub fn open_with_codec(
        transport: Transport,
        registry: Arc<RouteRegistry>,
        config: SessionConfig,
        strategy: ExecutionStrategy,
        role: Role,
        codec: Codec,
    ) -> Session {
        let admission = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let session = Session {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                role,
                transport,
                codec,
                registry,
                serial: SerialAllocator::new(role),
                pending: PendingCalls::new(config.max_pending_calls),
                locks: LockTable::new(),
                instances: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                listener_serial: AtomicU64::new(0),
                binary_handler: Mutex::new(None),
                close_hook: Mutex::new(None),
                admission,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
                closed: AtomicBool::new(false),
                started: Instant::now(),
                config,
                strategy,
            }),
        };

        tokio::spawn(session.clone().run());
        if session.inner.role == Role::Server && session.inner.config.keepalive_enabled {
            tokio::spawn(session.clone().keepalive());
        }
        session
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.inner.registry
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a listener for identifier-less event frames. Each delivery
    /// runs as its own spawned task. The returned handle removes exactly
    /// this listener.
    pub fn add_event_listener<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: ListenerFn = Arc::new(move |event| Box::pin(listener(event)));
        let id = self.inner.listener_serial.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, wrapped);
        ListenerId(id)
    }

    /// Remove one listener. Returns whether it was still registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.lock().remove(&id.0).is_some()
    }

    /// Drop every registered event listener.
    pub fn remove_event_listeners(&self) {
        self.inner.listeners.lock().clear();
    }

    /// Replace the binary-frame hook. Without one, binary frames are logged
    /// and dropped.
    pub fn set_binary_handler(&self, handler: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        *self.inner.binary_handler.lock() = Some(Arc::new(handler));
    }

    pub(crate) fn set_close_hook(&self, hook: CloseHook) {
        *self.inner.close_hook.lock() = Some(hook);
    }

    /// Call a method on the peer, bounded by the session's default call
    /// timeout (unbounded when unset).
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.call_inner(method, params, self.inner.config.default_call_timeout)
            .await
    }

    /// Call with an explicit deadline. On timeout the local waiter gives up
    /// and forgets the call; no cancellation is sent to the peer, which may
    /// still run the handler to completion.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.call_inner(method, params, Some(timeout)).await
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        let id = self.inner.serial.allocate();
        let rx = self.inner.pending.register(id)?;
        let guard = PendingGuard::new(&self.inner.pending, id);

        let payload = call_payload(id, method, &params);
        let text = self.inner.codec.encode(&payload)?;
        self.inner
            .transport
            .send_frame(WireFrame::Text(text))
            .await?;
        tracing::debug!(session = %self.inner.id, id, method, "call sent");

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(outcome) => outcome,
                // The guard drops here and removes the slot, so a late
                // response finds nothing to settle.
                Err(_) => return Err(CallError::TimedOut),
            },
            None => rx.await,
        };
        guard.disarm();

        match outcome {
            Ok(outcome) => outcome.into_call_result(),
            Err(_) => Err(CallError::ConnectionClosed),
        }
    }

    /// Build a dotted call path fluently.
    pub fn proxy(&self) -> Proxy {
        Proxy {
            session: self.clone(),
            path: String::new(),
        }
    }

    /// Send an identifier-less event frame. The peer does not correlate or
    /// answer it.
    pub async fn emit(&self, event: Value) -> Result<(), CallError> {
        let text = self.inner.codec.encode(&event)?;
        self.inner
            .transport
            .send_frame(WireFrame::Text(text))
            .await?;
        Ok(())
    }

    /// Initiate close. Idempotent: the first caller wins; later and
    /// concurrent calls observe the closed state and return. Outstanding
    /// calls resolve with a connection-closed error immediately; the run
    /// loop finishes teardown.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session = %self.inner.id, "closing");
        self.inner.cancel.cancel();
        self.inner.pending.settle_all_closed();
        self.inner.transport.close();
    }

    /// Wait until teardown has finished.
    pub async fn wait_closed(&self) {
        self.inner.done.cancelled().await;
    }

    async fn run(self) {
        loop {
            let frame = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                frame = self.inner.transport.recv_frame() => frame,
            };
            match frame {
                Ok(WireFrame::Text(text)) => self.handle_text(text),
                Ok(WireFrame::Binary(bytes)) => self.handle_binary(bytes),
                Err(e) => {
                    tracing::debug!(session = %self.inner.id, error = %e, "transport ended");
                    break;
                }
            }
        }
        self.close();
        self.finalize().await;
    }

    /// Teardown. Runs exactly once, on the run loop after close.
    async fn finalize(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let instances: Vec<_> = self
            .inner
            .instances
            .lock()
            .drain()
            .map(|(_, instance)| instance)
            .collect();
        for instance in instances {
            instance.teardown();
        }

        let hook = self.inner.close_hook.lock().take();
        if let Some(hook) = hook {
            hook(self.inner.id);
        }
        self.inner.done.cancel();
        tracing::debug!(session = %self.inner.id, "closed");
    }

    fn handle_text(&self, text: String) {
        let payload = match self.inner.codec.decode(&text) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(session = %self.inner.id, error = %e, "dropping malformed frame");
                return;
            }
        };
        let inbound = match Inbound::classify(payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(session = %self.inner.id, error = %e, "dropping unclassifiable frame");
                return;
            }
        };
        match inbound {
            Inbound::Event(event) => self.deliver_event(event),
            Inbound::Call { id, method, params } => {
                let session = self.clone();
                self.inner.tracker.spawn(async move {
                    let cancel = session.inner.cancel.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = session.dispatch_call(id, method, params) => {}
                    }
                });
            }
            Inbound::Result { id, value } => {
                if !self.inner.pending.settle(id, Outcome::Result(value)) {
                    tracing::debug!(session = %self.inner.id, id, "stale result frame");
                }
            }
            Inbound::Error { id, error } => {
                let error = RemoteError::from_value(error);
                if !self.inner.pending.settle(id, Outcome::Error(error)) {
                    tracing::debug!(session = %self.inner.id, id, "stale error frame");
                }
            }
            Inbound::Ack { id } => {
                if !self.inner.pending.settle(id, Outcome::Result(Value::Null)) {
                    tracing::debug!(session = %self.inner.id, id, "stale acknowledgement");
                }
            }
        }
    }

    fn deliver_event(&self, event: Value) {
        let listeners: Vec<ListenerFn> = self.inner.listeners.lock().values().cloned().collect();
        tracing::debug!(session = %self.inner.id, listeners = listeners.len(), "event frame");
        for listener in listeners {
            self.inner.tracker.spawn(listener(event.clone()));
        }
    }

    fn handle_binary(&self, bytes: Vec<u8>) {
        let handler = self.inner.binary_handler.lock().clone();
        match handler {
            Some(handler) => handler(bytes),
            None => {
                tracing::debug!(session = %self.inner.id, len = bytes.len(), "dropping binary frame")
            }
        }
    }

    async fn dispatch_call(&self, id: u64, method: String, params: Value) {
        // Calls beyond the concurrency bound queue here; they are never
        // refused.
        let permit = self.inner.admission.clone().acquire_owned().await;
        let Ok(_permit) = permit else { return };

        let lock = self.inner.locks.acquire_handle(id);
        let outcome = {
            let _serialized = lock.lock().await;
            self.execute(&method, params).await
        };
        self.schedule_lock_cleanup(id);

        let reply = match outcome {
            Ok(value) => result_payload(id, value),
            Err(e) => {
                tracing::debug!(session = %self.inner.id, id, method = %method, error = %e, "call failed");
                error_payload(
                    id,
                    &ErrorFrame {
                        kind: e.kind,
                        message: e.message,
                    },
                )
            }
        };
        let text = match self.inner.codec.encode(&reply) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(session = %self.inner.id, id, error = %e, "reply encode failed");
                return;
            }
        };
        if let Err(e) = self.inner.transport.send_frame(WireFrame::Text(text)).await {
            tracing::debug!(session = %self.inner.id, id, error = %e, "reply send failed");
        }
    }

    /// Per-identifier locks outlive their dispatch by a grace delay, so a
    /// near-simultaneous duplicate delivery still serializes on them.
    fn schedule_lock_cleanup(&self, id: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.config.lock_grace) => {}
            }
            inner.locks.release(id);
        });
    }

    async fn execute(&self, path: &str, params: Value) -> Result<Value, HandlerError> {
        let args = Args::split(params);
        let resolved = self.inner.registry.resolve(path)?;
        let future = match resolved {
            Resolved::Function(f) => f(self.clone(), args),
            Resolved::Stateful {
                name,
                factory,
                method,
            } => {
                let instance = {
                    let mut instances = self.inner.instances.lock();
                    instances
                        .entry(name)
                        .or_insert_with(|| factory.instantiate(self))
                        .clone()
                };
                instance.dispatch(self.clone(), &method, args)?
            }
        };
        self.inner.strategy.invoke(future).await
    }

    /// Milliseconds since the session opened. Monotonic; used as the
    /// keepalive ping payload.
    fn uptime_millis(&self) -> u64 {
        self.inner.started.elapsed().as_millis() as u64
    }

    async fn keepalive(self) {
        let interval = self.inner.config.keepalive_interval;
        let latency_bound = self.inner.config.client_timeout;
        let mut seq: u64 = 0;
        loop {
            seq += 1;
            let started = Instant::now();
            let params = json!({ "seq": seq, "ts": self.uptime_millis() });
            let result = tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                result = self.call_with_timeout("ping", params, interval) => result,
            };
            match result {
                Ok(_) if started.elapsed() <= latency_bound => {}
                Ok(_) => {
                    tracing::warn!(session = %self.inner.id, seq, "keepalive round trip too slow");
                    break;
                }
                Err(CallError::ConnectionClosed) => return,
                Err(e) => {
                    tracing::warn!(session = %self.inner.id, seq, error = %e, "keepalive failed");
                    break;
                }
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Fluent dotted-path builder over a session.
#[derive(Clone)]
pub struct Proxy {
    session: Session,
    path: String,
}

impl Proxy {
    pub fn route(mut self, name: &str) -> Self {
        self.path = name.to_owned();
        self
    }

    pub fn method(mut self, name: &str) -> Self {
        if !self.path.is_empty() {
            self.path.push('.');
        }
        self.path.push_str(name);
        self
    }

    pub async fn call(self, params: Value) -> Result<Value, CallError> {
        self.session.call(&self.path, params).await
    }

    pub async fn call_with_timeout(
        self,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.session
            .call_with_timeout(&self.path, params, timeout)
            .await
    }
}
