//! Process-wide gateway counters.
//!
//! One atomic counter set shared by every subsystem. Writers use relaxed
//! increments on the hot path; readers may observe slightly stale values.
//! [`snapshot`] returns the whole set by value so tests and the periodic
//! metrics logger can compare deltas without tearing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::Serialize;

/// Error-counter labels. The set is closed to bound cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLabel {
    TcpRead,
    TcpWrite,
    Handshake,
    SerialWrite,
    SerialTxOverflow,
    SerialRead,
    SocketCanWrite,
    SocketCanTxOverflow,
    SocketCanRead,
}

impl ErrorLabel {
    /// All labels, in stable order.
    pub const ALL: [ErrorLabel; 9] = [
        ErrorLabel::TcpRead,
        ErrorLabel::TcpWrite,
        ErrorLabel::Handshake,
        ErrorLabel::SerialWrite,
        ErrorLabel::SerialTxOverflow,
        ErrorLabel::SerialRead,
        ErrorLabel::SocketCanWrite,
        ErrorLabel::SocketCanTxOverflow,
        ErrorLabel::SocketCanRead,
    ];

    /// Stable label string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TcpRead => "tcp_read",
            Self::TcpWrite => "tcp_write",
            Self::Handshake => "handshake",
            Self::SerialWrite => "serial_write",
            Self::SerialTxOverflow => "serial_tx_overflow",
            Self::SerialRead => "serial_read",
            Self::SocketCanWrite => "socketcan_write",
            Self::SocketCanTxOverflow => "socketcan_tx_overflow",
            Self::SocketCanRead => "socketcan_read",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for ErrorLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The gateway counter set.
#[derive(Debug, Default)]
pub struct Metrics {
    serial_rx: AtomicU64,
    serial_tx: AtomicU64,
    socketcan_rx: AtomicU64,
    socketcan_tx: AtomicU64,
    tcp_rx: AtomicU64,
    tcp_tx: AtomicU64,
    hub_dropped: AtomicU64,
    hub_kicked: AtomicU64,
    hub_rejected: AtomicU64,
    malformed_frames: AtomicU64,
    errors_total: AtomicU64,
    errors: [AtomicU64; 9],
    // Gauges
    hub_active_clients: AtomicU64,
    hub_broadcast_fanout: AtomicU64,
    hub_queue_depth_max: AtomicU64,
    hub_queue_depth_avg: AtomicU64,
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

/// The global counter set.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

/// A point-in-time copy of every counter and gauge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub serial_rx: u64,
    pub serial_tx: u64,
    pub socketcan_rx: u64,
    pub socketcan_tx: u64,
    pub tcp_rx: u64,
    pub tcp_tx: u64,
    pub hub_dropped: u64,
    pub hub_kicked: u64,
    pub hub_rejected: u64,
    pub malformed_frames: u64,
    /// Sum across all error labels.
    pub errors: u64,
    pub hub_active_clients: u64,
    pub hub_broadcast_fanout: u64,
    pub hub_queue_depth_max: u64,
    pub hub_queue_depth_avg: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            serial_rx: self.serial_rx.load(Ordering::Relaxed),
            serial_tx: self.serial_tx.load(Ordering::Relaxed),
            socketcan_rx: self.socketcan_rx.load(Ordering::Relaxed),
            socketcan_tx: self.socketcan_tx.load(Ordering::Relaxed),
            tcp_rx: self.tcp_rx.load(Ordering::Relaxed),
            tcp_tx: self.tcp_tx.load(Ordering::Relaxed),
            hub_dropped: self.hub_dropped.load(Ordering::Relaxed),
            hub_kicked: self.hub_kicked.load(Ordering::Relaxed),
            hub_rejected: self.hub_rejected.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            errors: self.errors_total.load(Ordering::Relaxed),
            hub_active_clients: self.hub_active_clients.load(Ordering::Relaxed),
            hub_broadcast_fanout: self.hub_broadcast_fanout.load(Ordering::Relaxed),
            hub_queue_depth_max: self.hub_queue_depth_max.load(Ordering::Relaxed),
            hub_queue_depth_avg: self.hub_queue_depth_avg.load(Ordering::Relaxed),
        }
    }

    /// Per-label error count.
    pub fn error_count(&self, label: ErrorLabel) -> u64 {
        self.errors[label.index()].load(Ordering::Relaxed)
    }
}

// Wrapper helpers to keep call sites simple.

pub fn inc_serial_rx() {
    METRICS.serial_rx.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_serial_tx() {
    METRICS.serial_tx.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_socketcan_rx() {
    METRICS.socketcan_rx.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_socketcan_tx() {
    METRICS.socketcan_tx.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_tcp_rx() {
    METRICS.tcp_rx.fetch_add(1, Ordering::Relaxed);
}

/// Incremented by the flushed batch size, not per write call.
pub fn add_tcp_tx(n: usize) {
    METRICS.tcp_tx.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn inc_hub_drop() {
    METRICS.hub_dropped.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_hub_kick() {
    METRICS.hub_kicked.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_hub_reject() {
    METRICS.hub_rejected.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_malformed() {
    METRICS.malformed_frames.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_error(label: ErrorLabel) {
    METRICS.errors_total.fetch_add(1, Ordering::Relaxed);
    METRICS.errors[label.index()].fetch_add(1, Ordering::Relaxed);
}

pub fn set_hub_clients(n: usize) {
    METRICS.hub_active_clients.store(n as u64, Ordering::Relaxed);
}

pub fn set_broadcast_fanout(n: usize) {
    METRICS.hub_broadcast_fanout.store(n as u64, Ordering::Relaxed);
}

/// Record a queue-depth sample taken during a broadcast.
pub fn set_queue_depth(max: usize, avg: usize) {
    METRICS.hub_queue_depth_max.store(max as u64, Ordering::Relaxed);
    METRICS.hub_queue_depth_avg.store(avg as u64, Ordering::Relaxed);
}

// ============================================================================
// Readiness
// ============================================================================

type ReadinessFn = Box<dyn Fn() -> bool + Send + Sync>;

static READINESS: Lazy<RwLock<Option<ReadinessFn>>> = Lazy::new(|| RwLock::new(None));

/// Register the predicate consulted by [`is_ready`].
pub fn set_readiness_fn(f: impl Fn() -> bool + Send + Sync + 'static) {
    *READINESS.write().expect("readiness lock poisoned") = Some(Box::new(f));
}

/// Whether the gateway reports ready.
///
/// Defaults to ready when no predicate has been registered, so external
/// health probes do not flap during startup ordering.
pub fn is_ready() -> bool {
    match READINESS.read().expect("readiness lock poisoned").as_ref() {
        Some(f) => f(),
        None => true,
    }
}

/// Serializes tests that assert exact values or deltas of the global
/// counters, which concurrent tests would otherwise perturb.
#[cfg(test)]
pub(crate) static COUNTER_TEST_LOCK: Lazy<std::sync::Mutex<()>> =
    Lazy::new(|| std::sync::Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_deltas() {
        let _g = COUNTER_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let pre = metrics().snapshot();
        inc_tcp_rx();
        add_tcp_tx(5);
        inc_malformed();
        let post = metrics().snapshot();

        assert!(post.tcp_rx >= pre.tcp_rx + 1);
        assert!(post.tcp_tx >= pre.tcp_tx + 5);
        assert!(post.malformed_frames >= pre.malformed_frames + 1);
    }

    #[test]
    fn test_error_labels() {
        let _g = COUNTER_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let pre_total = metrics().snapshot().errors;
        let pre_label = metrics().error_count(ErrorLabel::Handshake);
        inc_error(ErrorLabel::Handshake);
        assert!(metrics().snapshot().errors >= pre_total + 1);
        assert!(metrics().error_count(ErrorLabel::Handshake) >= pre_label + 1);
    }

    #[test]
    fn test_gauges_store() {
        let _g = COUNTER_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        set_queue_depth(7, 3);
        let snap = metrics().snapshot();
        assert_eq!(snap.hub_queue_depth_max, 7);
        assert_eq!(snap.hub_queue_depth_avg, 3);
    }

    #[test]
    fn test_label_strings_stable() {
        assert_eq!(ErrorLabel::SerialTxOverflow.as_str(), "serial_tx_overflow");
        assert_eq!(ErrorLabel::ALL.len(), 9);
    }
}
