//! Broadcast hub fanning backend frames out to TCP clients.
//!
//! Every client owns one bounded outbound queue and a one-shot closure
//! signal. `broadcast` snapshots the registry under a read guard and then
//! performs only non-blocking sends, so a slow client can never stall the
//! fan-out to fast ones. Backpressure on a full queue follows the configured
//! policy: `Drop` loses the frame for that client, `Kick` signals the
//! client's closure channel and the client's writer tears the connection
//! down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::core::frame::CanFrame;
use crate::core::metrics;

/// Backpressure policy applied when a client's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Drop the frame for that client; the client stays connected.
    #[default]
    Drop,

    /// Disconnect the client; its writer observes the closure signal.
    Kick,
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drop => f.write_str("drop"),
            Self::Kick => f.write_str("kick"),
        }
    }
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A connected TCP subscriber.
///
/// Created on successful handshake and destroyed exactly once when its
/// writer exits; registry membership is independent of whether the socket is
/// still live.
pub struct Client {
    id: u64,
    out_tx: mpsc::Sender<CanFrame>,
    out_rx: Mutex<Option<mpsc::Receiver<CanFrame>>>,
    closed_tx: watch::Sender<bool>,
}

impl Client {
    /// Allocate a client with an outbound queue of `buffer` frames.
    pub fn new(buffer: usize) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            closed_tx,
        })
    }

    /// Stable identity within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the consuming end of the outbound queue.
    ///
    /// The writer calls this exactly once at spawn; later calls get `None`.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<CanFrame>> {
        self.out_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Signal closure (idempotent).
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    /// Whether the closure signal has fired.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// A receiver observing the closure signal.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Frames currently queued for this client.
    fn queue_depth(&self) -> usize {
        self.out_tx.max_capacity() - self.out_tx.capacity()
    }
}

/// Registry of connected clients with a shared backpressure policy.
pub struct Hub {
    clients: RwLock<HashMap<u64, Arc<Client>>>,
    out_buf_size: usize,
    policy: BackpressurePolicy,
}

impl Hub {
    /// A hub with default settings (drop policy, server-chosen buffers).
    pub fn new() -> Self {
        Self::with_config(0, BackpressurePolicy::Drop)
    }

    /// A hub with an explicit per-client buffer size and policy.
    ///
    /// `out_buf_size == 0` leaves the buffer choice to the server default.
    pub fn with_config(out_buf_size: usize, policy: BackpressurePolicy) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            out_buf_size,
            policy,
        }
    }

    /// Per-client outbound buffer size (0 = server default).
    pub fn out_buf_size(&self) -> usize {
        self.out_buf_size
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Register a client. Re-inserting the same client is a no-op.
    pub fn add(&self, client: Arc<Client>) {
        let (prev, cur) = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            let prev = clients.len();
            clients.insert(client.id, client);
            (prev, clients.len())
        };
        if prev == 0 && cur == 1 {
            info!("clients_first_connected");
        }
    }

    /// Unregister a client and fire its closure signal; safe to call more
    /// than once.
    pub fn remove(&self, client: &Arc<Client>) {
        let (existed, cur) = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            let existed = clients.remove(&client.id).is_some();
            (existed, clients.len())
        };
        client.close();
        metrics::set_hub_clients(cur);
        if existed && cur == 0 {
            info!("clients_last_disconnected");
        }
    }

    /// Send a frame to every connected client under the backpressure policy.
    pub fn broadcast(&self, frame: CanFrame) {
        let clients = self.snapshot();
        metrics::set_broadcast_fanout(clients.len());
        metrics::set_hub_clients(clients.len());

        if !clients.is_empty() {
            let mut max = 0usize;
            let mut sum = 0usize;
            for c in &clients {
                let depth = c.queue_depth();
                max = max.max(depth);
                sum += depth;
            }
            metrics::set_queue_depth(max, sum / clients.len());
        }

        for c in &clients {
            match c.out_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => match self.policy {
                    BackpressurePolicy::Kick => {
                        metrics::inc_hub_kick();
                        // Writer exits on the signal; removal happens in its
                        // shutdown path.
                        c.close();
                    }
                    BackpressurePolicy::Drop => metrics::inc_hub_drop(),
                },
                // Receiver already taken down by an exiting writer.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// A point-in-time copy of the registry.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients.values().cloned().collect()
    }

    /// Number of registered clients.
    pub fn count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metrics::{metrics, COUNTER_TEST_LOCK};
    use std::time::{Duration, Instant};

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        COUNTER_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id | crate::core::frame::CAN_EFF_FLAG, &[])
    }

    // ========== registry tests ==========

    #[tokio::test]
    async fn test_add_idempotent() {
        let hub = Hub::new();
        let c = Client::new(4);
        hub.add(Arc::clone(&c));
        hub.add(Arc::clone(&c));
        assert_eq!(hub.count(), 1);
    }

    #[tokio::test]
    async fn test_remove_signals_closure_once() {
        let _g = lock();
        let hub = Hub::new();
        let c = Client::new(4);
        hub.add(Arc::clone(&c));

        assert!(!c.is_closed());
        hub.remove(&c);
        assert!(c.is_closed());
        assert_eq!(hub.count(), 0);

        // Second removal is a no-op.
        hub.remove(&c);
        assert_eq!(hub.count(), 0);
    }

    // ========== broadcast tests ==========

    #[tokio::test]
    async fn test_broadcast_drop_does_not_block() {
        let _g = lock();
        let hub = Hub::with_config(4, BackpressurePolicy::Drop);
        let c = Client::new(4);
        hub.add(Arc::clone(&c));

        // Nobody reads from the client; 1000 broadcasts must still be fast.
        let start = Instant::now();
        for _ in 0..1000 {
            hub.broadcast(frame(0x123));
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(c.queue_depth(), 4);
        assert!(!c.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_drop_keeps_others_flowing() {
        let _g = lock();
        let hub = Hub::with_config(0, BackpressurePolicy::Drop);
        let slow = Client::new(1);
        let fast = Client::new(16);
        hub.add(Arc::clone(&slow));
        hub.add(Arc::clone(&fast));

        let mut fast_rx = fast.take_outbound().unwrap();
        let pre = metrics().snapshot().hub_dropped;

        for _ in 0..10 {
            hub.broadcast(frame(0x2));
        }

        // Slow saturated at its buffer; fast got everything.
        let mut got = 0;
        while fast_rx.try_recv().is_ok() {
            got += 1;
        }
        assert_eq!(got, 10);
        assert_eq!(slow.queue_depth(), 1);
        assert!(metrics().snapshot().hub_dropped >= pre + 9);
        assert!(!slow.is_closed());
        assert!(!fast.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_kick_closes_slow_client() {
        let _g = lock();
        let hub = Hub::with_config(0, BackpressurePolicy::Kick);
        let slow = Client::new(1);
        hub.add(Arc::clone(&slow));

        let pre = metrics().snapshot().hub_kicked;
        hub.broadcast(frame(0xA00)); // fills
        assert!(!slow.is_closed());
        hub.broadcast(frame(0xA01)); // overflows -> kick
        assert!(slow.is_closed());
        assert!(metrics().snapshot().hub_kicked >= pre + 1);
    }

    #[tokio::test]
    async fn test_broadcast_updates_gauges() {
        let _g = lock();
        let hub = Hub::with_config(0, BackpressurePolicy::Drop);
        let a = Client::new(8);
        let b = Client::new(8);
        hub.add(Arc::clone(&a));
        hub.add(Arc::clone(&b));

        hub.broadcast(frame(0x1));
        hub.broadcast(frame(0x2));

        let snap = metrics().snapshot();
        assert_eq!(snap.hub_broadcast_fanout, 2);
        assert_eq!(snap.hub_active_clients, 2);
        // Second broadcast observed one queued frame per client.
        assert_eq!(snap.hub_queue_depth_max, 1);
        assert_eq!(snap.hub_queue_depth_avg, 1);
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_per_client() {
        let _g = lock();
        let hub = Hub::with_config(0, BackpressurePolicy::Drop);
        let c = Client::new(16);
        hub.add(Arc::clone(&c));
        let mut rx = c.take_outbound().unwrap();

        for i in 0..5u32 {
            hub.broadcast(frame(0x100 + i));
        }
        for i in 0..5u32 {
            let fr = rx.try_recv().unwrap();
            assert_eq!(fr.id_value(), 0x100 + i);
        }
    }

    #[tokio::test]
    async fn test_membership_change_affects_next_broadcast_only() {
        let _g = lock();
        let hub = Hub::with_config(0, BackpressurePolicy::Drop);
        let a = Client::new(4);
        hub.add(Arc::clone(&a));

        hub.broadcast(frame(0x1));
        hub.remove(&a);
        hub.broadcast(frame(0x2));

        let mut rx = a.take_outbound().unwrap();
        assert_eq!(rx.try_recv().unwrap().id_value(), 0x1);
        assert!(rx.try_recv().is_err());
    }
}
