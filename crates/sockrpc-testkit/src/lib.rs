//! sockrpc-testkit: conformance scenarios for sockrpc transports.
//!
//! Provides the [`TransportFactory`] trait and shared protocol scenarios
//! that every transport must pass. Each transport implements the factory in
//! its own test module and runs the scenarios:
//!
//! ```ignore
//! use sockrpc_testkit::{TestError, TransportFactory};
//!
//! struct MyFactory;
//!
//! impl TransportFactory for MyFactory {
//!     async fn connect_pair() -> Result<(Transport, Transport), TestError> {
//!         /* create connected pair */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn ping_roundtrip() {
//!     sockrpc_testkit::run_ping_roundtrip::<MyFactory>().await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use sockrpc::{
    Args, CallError, ExecutionStrategy, MaskPolicy, MethodTable, Role, RouteHandler,
    RouteRegistry, Session, SessionConfig, Transport, TransportError,
};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    Setup(String),
    Call(CallError),
    Transport(TransportError),
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Call(e) => write!(f, "call error: {e}"),
            TestError::Transport(e) => write!(f, "transport error: {e}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<CallError> for TestError {
    fn from(e: CallError) -> Self {
        TestError::Call(e)
    }
}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        TestError::Transport(e)
    }
}

impl From<sockrpc::RouteError> for TestError {
    fn from(e: sockrpc::RouteError) -> Self {
        TestError::Setup(e.to_string())
    }
}

/// Factory for connected transport pairs.
///
/// Returns (server_side, client_side): frames sent on one end are received
/// on the other.
pub trait TransportFactory: Send + Sync + 'static {
    fn connect_pair() -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send;
}

/// Install a test-writer tracing subscriber once per process.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::DEBUG.into()),
            )
            .with_test_writer()
            .init();
    });
}

// ============================================================================
// Test route: Reverse
// ============================================================================

/// Stateful route used by the conformance scenarios. `init` stores a
/// string, `reverse` reverses it in place, `get_data` reads it back.
pub struct ReverseRoute {
    data: Mutex<String>,
}

impl RouteHandler for ReverseRoute {
    fn attach(_session: &Session) -> Self {
        ReverseRoute {
            data: Mutex::new(String::new()),
        }
    }

    fn methods() -> MethodTable<Self> {
        // The builder's route type is not inferable from the closures alone.
        MethodTable::<Self>::builder(MaskPolicy::Default)
            .method("init", |this, _session, args: Args| async move {
                let data = args
                    .kwarg("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                *this.data.lock() = data;
                Ok(Value::Null)
            })
            .method("reverse", |this, _session, _args| async move {
                let mut data = this.data.lock();
                let reversed: String = data.chars().rev().collect();
                *data = reversed.clone();
                Ok(json!(reversed))
            })
            .method("get_data", |this, _session, _args| async move {
                Ok(json!(this.data.lock().clone()))
            })
            .method("_secret", |_this, _session, _args| async move {
                Ok(json!("leaked"))
            })
            .mask("hidden")
            .method("hidden", |_this, _session, _args| async move {
                Ok(json!("leaked"))
            })
            .build()
    }

    fn on_close(&self) {
        tracing::debug!("reverse route torn down");
    }
}

// ============================================================================
// Harness
// ============================================================================

fn test_config() -> SessionConfig {
    SessionConfig::new().keepalive_enabled(false)
}

async fn open_sessions<F: TransportFactory>(
    server_registry: Arc<RouteRegistry>,
    client_registry: Arc<RouteRegistry>,
) -> Result<(Session, Session), TestError> {
    let (server_end, client_end) = F::connect_pair().await?;
    let server = Session::open(
        server_end,
        server_registry,
        test_config(),
        ExecutionStrategy::Inline,
        Role::Server,
    );
    let client = Session::open(
        client_end,
        client_registry,
        test_config(),
        ExecutionStrategy::Inline,
        Role::Client,
    );
    Ok((server, client))
}

async fn open_default<F: TransportFactory>() -> Result<(Session, Session), TestError> {
    open_sessions::<F>(RouteRegistry::new(), RouteRegistry::new()).await
}

fn assert_remote_kind(error: CallError, expected: &str) -> Result<(), TestError> {
    match error {
        CallError::Remote(e) if e.kind.as_deref() == Some(expected) => Ok(()),
        other => Err(TestError::Assertion(format!(
            "expected remote {expected} error, got {other:?}"
        ))),
    }
}

fn assert_remote_message(error: CallError, expected: &str) -> Result<(), TestError> {
    match error {
        CallError::Remote(e) if e.message.as_deref() == Some(expected) => Ok(()),
        other => Err(TestError::Assertion(format!(
            "expected remote error {expected:?}, got {other:?}"
        ))),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// The built-in `ping` echoes its keyword arguments.
pub async fn run_ping_roundtrip<F: TransportFactory>() {
    if let Err(e) = run_ping_roundtrip_inner::<F>().await {
        panic!("run_ping_roundtrip failed: {e}");
    }
}

async fn run_ping_roundtrip_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (_server, client) = open_default::<F>().await?;
    let pong = client.call("ping", json!({"pong": "pong"})).await?;
    if pong != json!({"pong": "pong"}) {
        return Err(TestError::Assertion(format!("unexpected pong {pong}")));
    }
    Ok(())
}

/// Stateful route: one instance per session, mutated state shared across
/// calls. `init("abc")`, `reverse()`, `get_data()` ends in `"cba"`.
pub async fn run_stateful_reverse<F: TransportFactory>() {
    if let Err(e) = run_stateful_reverse_inner::<F>().await {
        panic!("run_stateful_reverse failed: {e}");
    }
}

async fn run_stateful_reverse_inner<F: TransportFactory>() -> Result<(), TestError> {
    let registry = RouteRegistry::new();
    registry.add_stateful::<ReverseRoute>("reverse")?;
    let (_server, client) = open_sessions::<F>(registry, RouteRegistry::new()).await?;

    client.call("reverse", json!({"data": "abc"})).await?;
    let reversed = client.call("reverse.reverse", Value::Null).await?;
    if reversed != json!("cba") {
        return Err(TestError::Assertion(format!("reverse returned {reversed}")));
    }
    let data = client.call("reverse.get_data", Value::Null).await?;
    if data != json!("cba") {
        return Err(TestError::Assertion(format!("get_data returned {data}")));
    }

    // Reversing again restores the original through the same memoized
    // instance; a fresh instance would have lost the state.
    client.call("reverse.reverse", Value::Null).await?;
    let data = client.call("reverse.get_data", Value::Null).await?;
    if data != json!("abc") {
        return Err(TestError::Assertion(format!(
            "instance state not shared, got {data}"
        )));
    }
    Ok(())
}

/// Masked and underscore-leading methods are never invocable; unknown
/// methods on a resolved route answer "Method not implemented".
pub async fn run_masked_and_unknown_methods<F: TransportFactory>() {
    if let Err(e) = run_masked_and_unknown_methods_inner::<F>().await {
        panic!("run_masked_and_unknown_methods failed: {e}");
    }
}

async fn run_masked_and_unknown_methods_inner<F: TransportFactory>() -> Result<(), TestError> {
    let registry = RouteRegistry::new();
    registry.add_stateful::<ReverseRoute>("reverse")?;
    let (_server, client) = open_sessions::<F>(registry, RouteRegistry::new()).await?;

    let err = client
        .call("reverse._secret", Value::Null)
        .await
        .expect_err("underscore method must be masked");
    assert_remote_message(err, "Method masked")?;

    let err = client
        .call("reverse.hidden", Value::Null)
        .await
        .expect_err("masked method must not be invocable");
    assert_remote_message(err, "Method masked")?;

    let err = client
        .call("reverse.absent", Value::Null)
        .await
        .expect_err("unknown method must fail");
    assert_remote_message(err, "Method not implemented")?;
    Ok(())
}

/// Unknown call paths answer with an unresolvable error frame and leave the
/// connection open.
pub async fn run_unresolvable_path<F: TransportFactory>() {
    if let Err(e) = run_unresolvable_path_inner::<F>().await {
        panic!("run_unresolvable_path failed: {e}");
    }
}

async fn run_unresolvable_path_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (_server, client) = open_default::<F>().await?;

    let err = client
        .call("ghost.walk", Value::Null)
        .await
        .expect_err("unknown path must fail");
    assert_remote_kind(err, "Unresolvable")?;

    // The failure is per-call; the connection still works.
    client.call("ping", json!({})).await?;
    Ok(())
}

/// N concurrent calls completing out of order are each matched to their own
/// caller.
pub async fn run_concurrent_out_of_order_calls<F: TransportFactory>() {
    if let Err(e) = run_concurrent_out_of_order_calls_inner::<F>().await {
        panic!("run_concurrent_out_of_order_calls failed: {e}");
    }
}

async fn run_concurrent_out_of_order_calls_inner<F: TransportFactory>() -> Result<(), TestError> {
    let registry = RouteRegistry::new();
    registry.add_route("delay", |_session, args: Args| async move {
        let ms = args.kwarg("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(args.kwarg("tag").cloned().unwrap_or(Value::Null))
    })?;
    let (_server, client) = open_sessions::<F>(registry, RouteRegistry::new()).await?;

    // Earlier calls sleep longer, so responses arrive in reverse order.
    let calls = [(120u64, "slow"), (60, "medium"), (5, "fast")];
    let futures = calls.map(|(ms, tag)| {
        let client = client.clone();
        async move {
            client
                .call("delay", json!({"ms": ms, "tag": tag}))
                .await
                .map(|v| (tag, v))
        }
    });
    for outcome in futures::future::join_all(futures).await {
        let (tag, value) = outcome?;
        if value != json!(tag) {
            return Err(TestError::Assertion(format!(
                "call tagged {tag} got {value}"
            )));
        }
    }
    Ok(())
}

/// Closing the session settles every outstanding call with a
/// connection-closed error.
pub async fn run_close_cancels_pending<F: TransportFactory>() {
    if let Err(e) = run_close_cancels_pending_inner::<F>().await {
        panic!("run_close_cancels_pending failed: {e}");
    }
}

async fn run_close_cancels_pending_inner<F: TransportFactory>() -> Result<(), TestError> {
    let registry = RouteRegistry::new();
    registry.add_route("hang", |_session, _args| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    })?;
    let (_server, client) = open_sessions::<F>(registry, RouteRegistry::new()).await?;

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.call("hang", Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close();

    match waiter.await {
        Ok(Err(CallError::ConnectionClosed)) => Ok(()),
        Ok(other) => Err(TestError::Assertion(format!(
            "expected connection-closed, got {other:?}"
        ))),
        Err(e) => Err(TestError::Assertion(format!("waiter panicked: {e}"))),
    }
}

/// A handler can call back to its own caller while servicing a call,
/// without deadlocking either read loop.
pub async fn run_nested_bidirectional_call<F: TransportFactory>() {
    if let Err(e) = run_nested_bidirectional_call_inner::<F>().await {
        panic!("run_nested_bidirectional_call failed: {e}");
    }
}

async fn run_nested_bidirectional_call_inner<F: TransportFactory>() -> Result<(), TestError> {
    let registry = RouteRegistry::new();
    registry.add_route("relay", |session: Session, _args| async move {
        // Reverse-direction call to the peer's built-in ping, awaited
        // inside this handler.
        let pong = session
            .call("ping", json!({"nested": true}))
            .await
            .map_err(|e| sockrpc::HandlerError::new("RelayError", e.to_string()))?;
        Ok(json!({ "relayed": pong }))
    })?;
    let (_server, client) = open_sessions::<F>(registry, RouteRegistry::new()).await?;

    let relayed = client
        .call_with_timeout("relay", Value::Null, Duration::from_secs(5))
        .await?;
    if relayed != json!({"relayed": {"nested": true}}) {
        return Err(TestError::Assertion(format!("relay returned {relayed}")));
    }
    Ok(())
}

/// Identifier-less frames reach event listeners and are never correlated
/// with pending calls.
pub async fn run_event_delivery<F: TransportFactory>() {
    if let Err(e) = run_event_delivery_inner::<F>().await {
        panic!("run_event_delivery failed: {e}");
    }
}

async fn run_event_delivery_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (server, client) = open_default::<F>().await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.add_event_listener(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
        }
    });

    client.emit(json!({"topic": "news", "data": 7})).await?;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .map_err(|_| TestError::Assertion("event never delivered".into()))?
        .ok_or_else(|| TestError::Assertion("listener channel closed".into()))?;
    if event != json!({"topic": "news", "data": 7}) {
        return Err(TestError::Assertion(format!("unexpected event {event}")));
    }
    Ok(())
}

/// A call deadline expires locally; the peer is not informed and the
/// connection stays usable.
pub async fn run_call_timeout<F: TransportFactory>() {
    if let Err(e) = run_call_timeout_inner::<F>().await {
        panic!("run_call_timeout failed: {e}");
    }
}

async fn run_call_timeout_inner<F: TransportFactory>() -> Result<(), TestError> {
    let registry = RouteRegistry::new();
    registry.add_route("hang", |_session, _args| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    })?;
    let (_server, client) = open_sessions::<F>(registry, RouteRegistry::new()).await?;

    match client
        .call_with_timeout("hang", Value::Null, Duration::from_millis(100))
        .await
    {
        Err(CallError::TimedOut) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected timeout, got {other:?}"
            )))
        }
    }

    // The timed-out call is forgotten; later calls still work.
    client.call("ping", json!({})).await?;
    Ok(())
}

/// Handler failures travel as `{type, message}` error frames.
pub async fn run_handler_error<F: TransportFactory>() {
    if let Err(e) = run_handler_error_inner::<F>().await {
        panic!("run_handler_error failed: {e}");
    }
}

async fn run_handler_error_inner<F: TransportFactory>() -> Result<(), TestError> {
    let registry = RouteRegistry::new();
    registry.add_route("fail", |_session, _args| async move {
        Err(sockrpc::HandlerError::new("ValueError", "no way"))
    })?;
    let (_server, client) = open_sessions::<F>(registry, RouteRegistry::new()).await?;

    let err = client
        .call("fail", Value::Null)
        .await
        .expect_err("handler error must fail the call");
    assert_remote_kind(err, "ValueError")?;
    Ok(())
}

/// One side closing is observed by the peer: its session ends, and calls on
/// it fail with a connection-closed error instead of hanging.
pub async fn run_peer_close_propagates<F: TransportFactory>() {
    if let Err(e) = run_peer_close_propagates_inner::<F>().await {
        panic!("run_peer_close_propagates failed: {e}");
    }
}

async fn run_peer_close_propagates_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (server, client) = open_default::<F>().await?;

    server.close();
    server.wait_closed().await;

    // The client runs no keepalive here; only the transport can tell it the
    // peer went away.
    tokio::time::timeout(Duration::from_secs(5), client.wait_closed())
        .await
        .map_err(|_| TestError::Assertion("peer close never reached the client".into()))?;
    if !client.is_closed() {
        return Err(TestError::Assertion("client still open after peer close".into()));
    }

    match client.call("ping", json!({})).await {
        Err(CallError::ConnectionClosed) => Ok(()),
        other => Err(TestError::Assertion(format!(
            "expected connection-closed, got {other:?}"
        ))),
    }
}

/// The accepting side's first outbound call uses identifier zero; the
/// response for id 0 is matched like any other.
pub async fn run_zero_id_call<F: TransportFactory>() {
    if let Err(e) = run_zero_id_call_inner::<F>().await {
        panic!("run_zero_id_call failed: {e}");
    }
}

async fn run_zero_id_call_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (server, _client) = open_default::<F>().await?;

    let pong = server.call("ping", json!({"first": true})).await?;
    if pong != json!({"first": true}) {
        return Err(TestError::Assertion(format!("unexpected pong {pong}")));
    }
    Ok(())
}
