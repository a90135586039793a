//! TCP server: listener, handshake gating, client admission and lifecycle.
//!
//! Per-connection state machine:
//!
//! ```text
//! Accepted -> Handshaking -> { Admitted, HandshakeFailed, Rejected }
//!          -> Running -> Disconnected
//! ```
//!
//! Each admitted client gets a reader task (TCP -> backend) and a writer
//! task (hub -> TCP, batching). Either side's exit initiates teardown; the
//! writer owns removal from the hub. A single cancellation signal roots the
//! accept loop and every per-connection task.

pub mod handshake;
mod reader;
mod writer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::core::error::{GatewayError, Result};
use crate::core::frame::CanFrame;
use crate::core::metrics;
use crate::core::traits::{FrameBatchEncoder, FrameDecoder, FrameSink};
use crate::hub::{Client, Hub};

pub use handshake::HELLO;

/// Default per-client outbound buffer when the hub does not configure one.
pub const DEFAULT_CLIENT_BUFFER: usize = 512;

/// Frames the reader drains per decode pass to amortize syscall overhead.
pub(crate) const READ_BATCH: usize = 16;

/// Pause after a transient accept failure.
const ACCEPT_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Await a `watch::Receiver<bool>` becoming `true`, without holding the
/// channel's internal read guard across other `select!` branches (unlike
/// `Receiver::wait_for`, whose `Ref` guard would otherwise be borrowed for
/// the duration of the `select!`).
async fn wait_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Predicate deciding whether a frame received from a client is forwarded.
pub type FrameFilter = Arc<dyn Fn(&CanFrame) -> bool + Send + Sync>;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen address (`host:port`; port 0 binds an ephemeral port).
    pub listen_addr: String,

    /// Writer flush interval.
    pub flush_interval: Duration,

    /// Writer batch size in frames.
    pub batch_size: usize,

    /// Per-connection read deadline applied to each decode pass.
    pub read_deadline: Duration,

    /// Hello exchange timeout.
    pub handshake_timeout: Duration,

    /// Maximum simultaneous clients (0 = unlimited).
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            flush_interval: Duration::from_millis(5),
            batch_size: 64,
            read_deadline: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(3),
            max_clients: 0,
        }
    }
}

/// Lifecycle counter values.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleSnapshot {
    pub accepted: u64,
    pub handshake_failed: u64,
    pub connected: u64,
    pub disconnected: u64,
    pub backend_overflow: u64,
    pub backend_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LifecycleCounters {
    pub(crate) accepted: AtomicU64,
    pub(crate) handshake_failed: AtomicU64,
    pub(crate) connected: AtomicU64,
    pub(crate) disconnected: AtomicU64,
    pub(crate) backend_overflow: AtomicU64,
    pub(crate) backend_errors: AtomicU64,
}

impl LifecycleCounters {
    fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            handshake_failed: self.handshake_failed.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            backend_overflow: self.backend_overflow.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Sender clone held by every spawned task; the shutdown cohort wait
/// completes when all clones have dropped.
pub(crate) type TaskGuard = mpsc::Sender<()>;

pub(crate) struct ServerInner<C> {
    pub(crate) cfg: ServerConfig,
    pub(crate) hub: Arc<Hub>,
    pub(crate) codec: C,
    pub(crate) send: Arc<dyn FrameSink>,
    pub(crate) frame_filter: Option<FrameFilter>,
    pub(crate) counters: LifecycleCounters,

    bound_addr: Mutex<Option<SocketAddr>>,
    ready_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    next_conn_id: AtomicU64,
    last_err: Mutex<Option<String>>,
    err_tx: mpsc::Sender<String>,
    err_rx: Mutex<Option<mpsc::Receiver<String>>>,
    clients: DashMap<u64, Arc<Client>>,
    tasks_tx: Mutex<Option<mpsc::Sender<()>>>,
    tasks_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl<C> ServerInner<C> {
    /// Record an error: error-label counter, last-error slot, observation
    /// channel.
    pub(crate) fn record_error(&self, err: &GatewayError) {
        if let Some(label) = err.metric_label() {
            metrics::inc_error(label);
        }
        let text = err.to_string();
        *self.last_err.lock().unwrap_or_else(|e| e.into_inner()) = Some(text.clone());
        let _ = self.err_tx.try_send(text);
    }

    /// Forward accepted frames to the backend, applying the frame filter.
    ///
    /// Filtered-out frames do not count toward `tcp_rx`. Overflow is a local
    /// backpressure event (debug); other backend errors are real failures.
    pub(crate) fn dispatch_frames(&self, frames: &[CanFrame], conn_id: u64) {
        for fr in frames {
            if let Some(filter) = &self.frame_filter {
                if !filter(fr) {
                    continue;
                }
            }
            metrics::inc_tcp_rx();
            match self.send.send_frame(*fr) {
                Ok(()) => {}
                Err(GatewayError::TxOverflow) => {
                    self.counters.backend_overflow.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        conn_id,
                        can_id = format_args!("0x{:X}", fr.can_id),
                        len = fr.len,
                        "backend_overflow_drop"
                    );
                }
                Err(e) => {
                    self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        conn_id,
                        error = %e,
                        can_id = format_args!("0x{:X}", fr.can_id),
                        "backend_tx_error"
                    );
                }
            }
        }
    }

    /// Remove a finished client from the connection registry.
    pub(crate) fn forget_client(&self, client: &Arc<Client>) {
        self.clients.remove(&client.id());
    }

    fn task_guard(&self) -> Option<TaskGuard> {
        self.tasks_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// The TCP gateway server. Cheap to clone; all state is shared.
pub struct Server<C> {
    inner: Arc<ServerInner<C>>,
}

impl<C> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Server<C>
where
    C: FrameDecoder + FrameBatchEncoder,
{
    /// Create a server over `hub`, decoding with `codec` and forwarding
    /// client frames to `send`.
    pub fn new(cfg: ServerConfig, hub: Arc<Hub>, codec: C, send: Arc<dyn FrameSink>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (tasks_tx, tasks_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(ServerInner {
                cfg,
                hub,
                codec,
                send,
                frame_filter: None,
                counters: LifecycleCounters::default(),
                bound_addr: Mutex::new(None),
                ready_tx,
                stop_tx,
                next_conn_id: AtomicU64::new(0),
                last_err: Mutex::new(None),
                err_tx,
                err_rx: Mutex::new(Some(err_rx)),
                clients: DashMap::new(),
                tasks_tx: Mutex::new(Some(tasks_tx)),
                tasks_rx: tokio::sync::Mutex::new(Some(tasks_rx)),
            }),
        }
    }

    /// Install a frame filter. Must be called before [`serve`](Self::serve).
    pub fn with_frame_filter(mut self, filter: FrameFilter) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("frame filter should be installed before the server is shared")
            .frame_filter = Some(filter);
        self
    }

    /// The bound listener address, once [`serve`](Self::serve) has bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .bound_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Observe the one-shot readiness signal (fires at listener bind).
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }

    /// Readiness predicate: listener bound and not cancelled.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow() && !*self.inner.stop_tx.borrow()
    }

    /// Most recent recorded error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_err
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take the error observation channel (first caller wins).
    pub fn errors(&self) -> Option<mpsc::Receiver<String>> {
        self.inner
            .err_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Current lifecycle counter values.
    pub fn lifecycle(&self) -> LifecycleSnapshot {
        self.inner.counters.snapshot()
    }

    /// Accept TCP clients until cancellation or a fatal listener error.
    pub async fn serve(&self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let listener = match TcpListener::bind(&self.inner.cfg.listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                let err = GatewayError::Listen(e);
                self.inner.record_error(&err);
                return Err(err);
            }
        };
        if let Ok(addr) = listener.local_addr() {
            *self
                .inner
                .bound_addr
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(addr);
            info!(addr = %addr, "tcp_listen");
        }
        self.inner.ready_tx.send_replace(true);
        info!("ready");

        let mut stop = self.inner.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = wait_true(&mut cancel) => {
                    self.inner.stop_tx.send_replace(true);
                    return Ok(());
                }
                _ = wait_true(&mut stop) => return Ok(()),
                res = listener.accept() => match res {
                    Ok((stream, peer)) => self.accept_conn(stream, peer, cancel.clone()).await,
                    Err(e) if is_transient_accept_error(&e) => {
                        tokio::time::sleep(ACCEPT_RETRY_PAUSE).await;
                    }
                    Err(e) => {
                        let err = GatewayError::Accept(e);
                        self.inner.record_error(&err);
                        self.inner.stop_tx.send_replace(true);
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Handshake, admission check and task spawn for one accepted socket.
    async fn accept_conn(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        cancel: watch::Receiver<bool>,
    ) {
        let inner = &self.inner;
        inner.counters.accepted.fetch_add(1, Ordering::Relaxed);
        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = stream.set_nodelay(true);

        if let Err(he) = handshake::handshake(&mut stream, inner.cfg.handshake_timeout).await {
            let err = GatewayError::Handshake(he);
            inner.record_error(&err);
            inner.counters.handshake_failed.fetch_add(1, Ordering::Relaxed);
            warn!(conn_id, remote = %peer, error = %err, "handshake_failed");
            return;
        }

        if inner.cfg.max_clients > 0 && inner.hub.count() >= inner.cfg.max_clients {
            metrics::inc_hub_reject();
            warn!(conn_id, remote = %peer, max_clients = inner.cfg.max_clients, "client_reject_max");
            return;
        }

        let Some(task_guard) = inner.task_guard() else {
            // Shutting down; refuse the connection.
            return;
        };

        let buf = match inner.hub.out_buf_size() {
            0 => DEFAULT_CLIENT_BUFFER,
            n => n,
        };
        let client = Client::new(buf);
        inner.hub.add(Arc::clone(&client));
        metrics::set_hub_clients(inner.hub.count());
        inner.clients.insert(client.id(), Arc::clone(&client));
        inner.counters.connected.fetch_add(1, Ordering::Relaxed);
        info!(conn_id, remote = %peer, "client_connected");

        let (rd, wr) = stream.into_split();
        let stop = inner.stop_tx.subscribe();
        tokio::spawn(writer::run_writer(
            Arc::clone(inner),
            wr,
            Arc::clone(&client),
            cancel.clone(),
            stop.clone(),
            conn_id,
            task_guard.clone(),
        ));
        tokio::spawn(reader::run_reader(
            Arc::clone(inner),
            rd,
            client,
            cancel.clone(),
            stop,
            conn_id,
            task_guard,
        ));
    }

    /// Graceful shutdown: stop accepting, wake every client task and wait
    /// for the cohort, bounded by `wait`.
    pub async fn shutdown(&self, wait: Duration) -> Result<()> {
        self.inner.stop_tx.send_replace(true);

        for entry in self.inner.clients.iter() {
            entry.value().close();
        }

        // Drop our cohort sender so the wait below completes when the last
        // task exits.
        self.inner
            .tasks_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let rx = self.inner.tasks_rx.lock().await.take();
        if let Some(mut rx) = rx {
            if tokio::time::timeout(wait, rx.recv()).await.is_err() {
                warn!("shutdown_timeout");
                return Err(GatewayError::Cancelled);
            }
        }

        let c = self.lifecycle();
        info!(
            accepted = c.accepted,
            handshake_fail = c.handshake_failed,
            connected = c.connected,
            disconnected = c.disconnected,
            backend_overflow = c.backend_overflow,
            backend_errors = c.backend_errors,
            "shutdown_summary"
        );
        Ok(())
    }
}

/// Connection-scoped accept failures are retried; anything else is fatal.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
