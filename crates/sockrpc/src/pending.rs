//! Outstanding-call bookkeeping: identifier allocation, the pending table
//! and the per-identifier inbound lock table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CallError, RemoteError};

/// Which end of the link this session is.
///
/// Identifiers advance by two from a role-dependent offset, so the two ends
/// of a connection draw from disjoint spaces and never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepting side; allocates even identifiers starting at 0.
    Server,
    /// Dialing side; allocates odd identifiers starting at 1.
    Client,
}

impl Role {
    fn offset(self) -> u64 {
        match self {
            Role::Server => 0,
            Role::Client => 1,
        }
    }
}

/// Stride-2 identifier allocator.
pub(crate) struct SerialAllocator {
    next: AtomicU64,
}

impl SerialAllocator {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            next: AtomicU64::new(role.offset()),
        }
    }

    pub(crate) fn allocate(&self) -> u64 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}

/// What a pending call resolved to.
#[derive(Debug)]
pub(crate) enum Outcome {
    Result(Value),
    Error(RemoteError),
    Closed,
}

impl Outcome {
    pub(crate) fn into_call_result(self) -> Result<Value, CallError> {
        match self {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(e) => Err(CallError::Remote(e)),
            Outcome::Closed => Err(CallError::ConnectionClosed),
        }
    }
}

/// Identifier-keyed table of waiters for outbound calls.
pub(crate) struct PendingCalls {
    slots: Mutex<Slots>,
    max_pending: usize,
}

struct Slots {
    waiters: HashMap<u64, oneshot::Sender<Outcome>>,
    /// Set by `settle_all_closed` under the same lock, so a registration
    /// racing with close is refused instead of stranded.
    closed: bool,
}

impl PendingCalls {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                waiters: HashMap::new(),
                closed: false,
            }),
            max_pending,
        }
    }

    /// Register a waiter for `id`. Fails when the table is already closed
    /// or the outstanding-call cap is reached; the call is refused before
    /// anything hits the wire.
    pub(crate) fn register(&self, id: u64) -> Result<oneshot::Receiver<Outcome>, CallError> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(CallError::ConnectionClosed);
        }
        if slots.waiters.len() >= self.max_pending {
            return Err(CallError::TooManyPending);
        }
        let (tx, rx) = oneshot::channel();
        slots.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Settle `id` with an outcome. Unknown or already-settled identifiers
    /// are ignored, which makes duplicate result and error frames no-ops.
    pub(crate) fn settle(&self, id: u64, outcome: Outcome) -> bool {
        match self.slots.lock().waiters.remove(&id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter without settling it. Used by the call path when the
    /// awaiting side gives up.
    pub(crate) fn forget(&self, id: u64) {
        self.slots.lock().waiters.remove(&id);
    }

    /// Resolve every remaining waiter with a connection-closed outcome and
    /// refuse registrations from now on.
    pub(crate) fn settle_all_closed(&self) {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock();
            slots.closed = true;
            slots.waiters.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Outcome::Closed);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().waiters.len()
    }
}

/// Removes a pending slot when the waiter abandons the call.
///
/// Armed on registration, disarmed once the outcome arrives. A timed-out or
/// cancelled `call` drops the guard and the slot with it, so a late response
/// finds nothing to settle.
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingCalls, id: u64) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.forget(self.id);
        }
    }
}

/// Per-identifier locks serializing duplicate deliveries of the same
/// inbound call id.
///
/// Entries are not removed when the dispatch finishes; the session schedules
/// removal after a grace delay, so a near-simultaneous duplicate still finds
/// the lock and queues behind the first delivery.
pub(crate) struct LockTable {
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn acquire_handle(&self, id: u64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub(crate) fn release(&self, id: u64) {
        self.locks.lock().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_allocate_disjoint_spaces() {
        let server = SerialAllocator::new(Role::Server);
        let client = SerialAllocator::new(Role::Client);

        assert_eq!(server.allocate(), 0);
        assert_eq!(server.allocate(), 2);
        assert_eq!(client.allocate(), 1);
        assert_eq!(client.allocate(), 3);
    }

    #[tokio::test]
    async fn settle_resolves_the_waiter() {
        let pending = PendingCalls::new(8);
        let rx = pending.register(4).unwrap();

        assert!(pending.settle(4, Outcome::Result(json!("pong"))));
        match rx.await.unwrap() {
            Outcome::Result(v) => assert_eq!(v, json!("pong")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn duplicate_settle_is_a_noop() {
        let pending = PendingCalls::new(8);
        let _rx = pending.register(4).unwrap();

        assert!(pending.settle(4, Outcome::Result(Value::Null)));
        assert!(!pending.settle(4, Outcome::Result(Value::Null)));
        assert!(!pending.settle(99, Outcome::Result(Value::Null)));
    }

    #[test]
    fn cap_refuses_registration() {
        let pending = PendingCalls::new(2);
        let _a = pending.register(0).unwrap();
        let _b = pending.register(2).unwrap();
        assert!(matches!(
            pending.register(4),
            Err(CallError::TooManyPending)
        ));
    }

    #[tokio::test]
    async fn settle_all_closed_drains_everything() {
        let pending = PendingCalls::new(8);
        let rx_a = pending.register(0).unwrap();
        let rx_b = pending.register(2).unwrap();

        pending.settle_all_closed();
        assert_eq!(pending.len(), 0);
        assert!(matches!(rx_a.await.unwrap(), Outcome::Closed));
        assert!(matches!(rx_b.await.unwrap(), Outcome::Closed));
    }

    #[test]
    fn registration_after_close_is_refused() {
        let pending = PendingCalls::new(8);
        let _rx = pending.register(0).unwrap();

        pending.settle_all_closed();
        // A caller that passed its closed-check just before the close must
        // not end up with a slot nothing will ever drain.
        assert!(matches!(
            pending.register(2),
            Err(CallError::ConnectionClosed)
        ));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn dropped_guard_removes_the_slot() {
        let pending = PendingCalls::new(8);
        let _rx = pending.register(6).unwrap();

        {
            let _guard = PendingGuard::new(&pending, 6);
        }
        assert_eq!(pending.len(), 0);
        assert!(!pending.settle(6, Outcome::Result(Value::Null)));
    }

    #[test]
    fn disarmed_guard_leaves_the_slot() {
        let pending = PendingCalls::new(8);
        let _rx = pending.register(6).unwrap();

        PendingGuard::new(&pending, 6).disarm();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn lock_table_hands_out_the_same_lock_per_id() {
        let table = LockTable::new();
        let a = table.acquire_handle(5);
        let b = table.acquire_handle(5);
        assert!(Arc::ptr_eq(&a, &b));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err());

        table.release(5);
        assert_eq!(table.len(), 0);
    }
}
