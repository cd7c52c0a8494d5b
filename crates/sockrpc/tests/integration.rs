//! End-to-end tests over the endpoint and client surfaces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sockrpc::{
    Args, CallError, Client, Codec, Endpoint, ExecutionStrategy, RouteRegistry, SessionConfig,
    Transport,
};

fn quiet_config() -> SessionConfig {
    SessionConfig::new().keepalive_enabled(false)
}

fn endpoint_with(registry: Arc<RouteRegistry>) -> Endpoint {
    Endpoint::with(registry, quiet_config(), ExecutionStrategy::Inline)
}

async fn accept_client(endpoint: &Endpoint) -> Client {
    let (server_end, client_end) = Transport::mem_pair();
    endpoint.accept(server_end).await.unwrap();
    Client::with(
        client_end,
        RouteRegistry::new(),
        quiet_config(),
        ExecutionStrategy::Inline,
    )
}

#[tokio::test]
async fn broadcast_to_zero_clients_is_empty() {
    let endpoint = endpoint_with(RouteRegistry::new());
    let results = endpoint.broadcast("ping", json!({})).await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let endpoint = endpoint_with(RouteRegistry::new());

    let clients = [
        accept_client(&endpoint).await,
        accept_client(&endpoint).await,
    ];
    for client in &clients {
        // Server->client calls resolve against each client's own registry.
        client
            .registry()
            .add_route("greet", |_s, args: Args| async move {
                Ok(args.kwarg("name").cloned().unwrap_or(Value::Null))
            })
            .unwrap();
    }
    assert_eq!(endpoint.client_count(), 2);

    let results = endpoint.broadcast("greet", json!({"name": "all"})).await;
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result.unwrap(), json!("all"));
    }
}

#[tokio::test]
async fn broadcast_carries_failures_alongside_results() {
    let endpoint = endpoint_with(RouteRegistry::new());

    let good = accept_client(&endpoint).await;
    good.registry()
        .add_route("work", |_s, _a| async { Ok(json!("done")) })
        .unwrap();
    // The second client never registers the route, so its call fails.
    let _bad = accept_client(&endpoint).await;

    let results = endpoint.broadcast("work", Value::Null).await;
    assert_eq!(results.len(), 2);
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let failed = results.iter().filter(|r| r.is_err()).count();
    assert_eq!((ok, failed), (1, 1));
}

#[tokio::test]
async fn authorize_hook_rejects_connections() {
    let endpoint = endpoint_with(RouteRegistry::new());
    endpoint.set_authorize(|_transport| async { false });

    let (server_end, _client_end) = Transport::mem_pair();
    let err = endpoint.accept(server_end).await.unwrap_err();
    assert!(matches!(err, sockrpc::AcceptError::Rejected));
    assert_eq!(endpoint.client_count(), 0);
}

#[tokio::test]
async fn closed_sessions_leave_the_client_table() {
    let endpoint = endpoint_with(RouteRegistry::new());
    let client = accept_client(&endpoint).await;
    assert_eq!(endpoint.client_count(), 1);

    let session = endpoint.clients().pop().unwrap();
    session.close();
    session.wait_closed().await;

    assert_eq!(endpoint.client_count(), 0);
    drop(client);
}

#[tokio::test]
async fn admission_gate_queues_without_dropping() {
    let registry = RouteRegistry::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let running = running.clone();
        let peak = peak.clone();
        registry
            .add_route("busy", move |_s, _a| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }

    let config = quiet_config().max_concurrent_requests(2);
    let endpoint = Endpoint::with(registry, config, ExecutionStrategy::Inline);
    let client = accept_client(&endpoint).await;

    let calls: Vec<_> = (0..6)
        .map(|_| {
            let session = client.session().clone();
            tokio::spawn(async move { session.call("busy", Value::Null).await })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }
    // Queued beyond the bound, never refused, never more than two at once.
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn spawned_strategy_serves_calls() {
    let registry = RouteRegistry::new();
    registry
        .add_route("double", |_s, args: Args| async move {
            let n = args.positional.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        })
        .unwrap();
    let endpoint = Endpoint::with(registry, quiet_config(), ExecutionStrategy::Spawned);
    let client = accept_client(&endpoint).await;

    assert_eq!(client.call("double", json!([21])).await.unwrap(), json!(42));
}

#[tokio::test]
async fn keepalive_evicts_a_dead_peer() {
    let config = SessionConfig::new().keepalive_interval(Duration::from_millis(150));
    let endpoint = Endpoint::with(RouteRegistry::new(), config, ExecutionStrategy::Inline);

    // The peer end never opens a session, so keepalive pings go unanswered.
    let (server_end, dead_end) = Transport::mem_pair();
    let session = endpoint.accept(server_end).await.unwrap();
    assert_eq!(endpoint.client_count(), 1);

    session.wait_closed().await;
    assert!(session.is_closed());
    assert_eq!(endpoint.client_count(), 0);
    drop(dead_end);
}

#[tokio::test]
async fn default_call_timeout_applies_to_plain_calls() {
    let registry = RouteRegistry::new();
    registry
        .add_route("hang", |_s, _a| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .unwrap();
    let endpoint = endpoint_with(registry);
    let (server_end, client_end) = Transport::mem_pair();
    endpoint.accept(server_end).await.unwrap();

    let client = Client::with(
        client_end,
        RouteRegistry::new(),
        quiet_config().default_call_timeout(Some(Duration::from_millis(100))),
        ExecutionStrategy::Inline,
    );
    assert!(matches!(
        client.call("hang", Value::Null).await,
        Err(CallError::TimedOut)
    ));
}

#[tokio::test]
async fn custom_codec_is_plumbed_through_endpoint_and_client() {
    let server_encodes = Arc::new(AtomicUsize::new(0));
    let client_encodes = Arc::new(AtomicUsize::new(0));

    let counting_codec = |counter: Arc<AtomicUsize>| {
        Codec::new().with_dumps(move |value| {
            counter.fetch_add(1, Ordering::SeqCst);
            serde_json::to_string(value)
        })
    };

    let endpoint = Endpoint::with_codec(
        RouteRegistry::new(),
        quiet_config(),
        ExecutionStrategy::Inline,
        counting_codec(server_encodes.clone()),
    );
    let (server_end, client_end) = Transport::mem_pair();
    endpoint.accept(server_end).await.unwrap();
    let client = Client::with_codec(
        client_end,
        RouteRegistry::new(),
        quiet_config(),
        ExecutionStrategy::Inline,
        counting_codec(client_encodes.clone()),
    );

    client.call("ping", json!({})).await.unwrap();

    // One call frame from the client, one reply frame from the server, each
    // through its own configured dumps hook.
    assert_eq!(client_encodes.load(Ordering::SeqCst), 1);
    assert_eq!(server_encodes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_all_tears_down_every_session() {
    let endpoint = endpoint_with(RouteRegistry::new());
    let _a = accept_client(&endpoint).await;
    let _b = accept_client(&endpoint).await;
    assert_eq!(endpoint.client_count(), 2);

    endpoint.close_all().await;
    assert_eq!(endpoint.client_count(), 0);
}
