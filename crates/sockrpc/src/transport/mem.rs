//! In-process transport.
//!
//! This is the semantic reference backend. Every other transport must
//! behave identically to this one; if behavior differs, the other transport
//! has a bug. Frames pass through async channels without serialization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{TransportBackend, WireFrame};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    /// Channel to the peer's receiver. Taken on close, so the peer's
    /// `recv_frame` observes the closure as a drained channel.
    tx: parking_lot::Mutex<Option<mpsc::Sender<WireFrame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<WireFrame>>,
    closed: AtomicBool,
}

impl MemTransport {
    /// A connected pair: frames sent on one end are received on the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let inner_a = Arc::new(MemInner {
            tx: parking_lot::Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            closed: AtomicBool::new(false),
        });
        let inner_b = Arc::new(MemInner {
            tx: parking_lot::Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            closed: AtomicBool::new(false),
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }
}

impl TransportBackend for MemTransport {
    async fn send_frame(&self, frame: WireFrame) -> Result<(), TransportError> {
        let tx = self.inner.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv_frame(&self) -> Result<WireFrame, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_is_bidirectional() {
        let (a, b) = MemTransport::pair();

        a.send_frame(WireFrame::Text("from A".into())).await.unwrap();
        b.send_frame(WireFrame::Text("from B".into())).await.unwrap();

        assert_eq!(
            b.recv_frame().await.unwrap(),
            WireFrame::Text("from A".into())
        );
        assert_eq!(
            a.recv_frame().await.unwrap(),
            WireFrame::Text("from B".into())
        );
    }

    #[tokio::test]
    async fn binary_frames_pass_through() {
        let (a, b) = MemTransport::pair();
        a.send_frame(WireFrame::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(
            b.recv_frame().await.unwrap(),
            WireFrame::Binary(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn closed_end_refuses_io() {
        let (a, _b) = MemTransport::pair();
        a.close();
        assert!(a.is_closed());
        assert!(matches!(
            a.send_frame(WireFrame::Text("x".into())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_is_observed_by_the_peer() {
        let (a, b) = MemTransport::pair();

        // Closing one end alone must end the peer's read loop, even while
        // handles to the closed end stay alive.
        a.close();
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
        drop(a);
    }
}

