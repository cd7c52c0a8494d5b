//! Conformance suite for the in-memory reference transport.

use sockrpc::{Transport, TransportError};
use sockrpc_testkit::{TestError, TransportFactory};

struct MemFactory;

impl TransportFactory for MemFactory {
    async fn connect_pair() -> Result<(Transport, Transport), TestError> {
        Ok(Transport::mem_pair())
    }
}

#[tokio::test]
async fn factory_pair_connects() {
    sockrpc_testkit::init_tracing();
    let (a, b) = MemFactory::connect_pair().await.unwrap();
    assert!(!a.is_closed());
    assert!(!b.is_closed());
    a.close();
    assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
}

#[tokio::test]
async fn ping_roundtrip() {
    sockrpc_testkit::run_ping_roundtrip::<MemFactory>().await;
}

#[tokio::test]
async fn stateful_reverse() {
    sockrpc_testkit::run_stateful_reverse::<MemFactory>().await;
}

#[tokio::test]
async fn masked_and_unknown_methods() {
    sockrpc_testkit::run_masked_and_unknown_methods::<MemFactory>().await;
}

#[tokio::test]
async fn unresolvable_path() {
    sockrpc_testkit::run_unresolvable_path::<MemFactory>().await;
}

#[tokio::test]
async fn concurrent_out_of_order_calls() {
    sockrpc_testkit::run_concurrent_out_of_order_calls::<MemFactory>().await;
}

#[tokio::test]
async fn close_cancels_pending() {
    sockrpc_testkit::run_close_cancels_pending::<MemFactory>().await;
}

#[tokio::test]
async fn nested_bidirectional_call() {
    sockrpc_testkit::run_nested_bidirectional_call::<MemFactory>().await;
}

#[tokio::test]
async fn event_delivery() {
    sockrpc_testkit::run_event_delivery::<MemFactory>().await;
}

#[tokio::test]
async fn call_timeout() {
    sockrpc_testkit::run_call_timeout::<MemFactory>().await;
}

#[tokio::test]
async fn handler_error() {
    sockrpc_testkit::run_handler_error::<MemFactory>().await;
}

#[tokio::test]
async fn zero_id_call() {
    sockrpc_testkit::run_zero_id_call::<MemFactory>().await;
}

#[tokio::test]
async fn peer_close_propagates() {
    sockrpc_testkit::run_peer_close_propagates::<MemFactory>().await;
}
