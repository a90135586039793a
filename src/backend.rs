//! CAN backend selection, receive loops and transmit writers.
//!
//! One backend (serial UART adapter or SocketCAN raw socket) feeds the hub
//! and accepts frames from TCP clients through an [`AsyncTx`] funnel. Its
//! receive loop applies exponential backoff on non-fatal read errors and
//! terminates only on cancellation or device disappearance.

pub mod serial;
#[cfg(target_os = "linux")]
pub mod socketcan;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, BackendKind};
use crate::core::error::Result;
use crate::core::traits::FrameSink;
use crate::hub::Hub;
use crate::transport::AsyncTx;

/// Capacity of the async TX ring.
pub const TX_QUEUE_SIZE: usize = 1024;

/// Per-read buffer for the serial backend.
pub const SERIAL_READ_BUF: usize = 4096;

/// Capacity above which the serial RX accumulator is discarded and
/// reallocated once empty, so bursts of noise cannot permanently retain a
/// large backing allocation.
pub const LARGE_BUFFER_RECLAIM: usize = 16 * 1024;

/// Poll cadence for the nonblocking SocketCAN read loop.
#[cfg(target_os = "linux")]
pub(crate) const SOCKETCAN_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub const RX_BACKOFF_MIN: Duration = Duration::from_millis(20);
pub const RX_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Exponential backoff for backend read failures.
///
/// Starts at [`RX_BACKOFF_MIN`], doubles per failure, caps at
/// [`RX_BACKOFF_MAX`], resets on the next successful read.
#[derive(Debug)]
pub struct RxBackoff {
    current: Duration,
}

impl RxBackoff {
    pub fn new() -> Self {
        Self {
            current: RX_BACKOFF_MIN,
        }
    }

    /// The delay to apply now; doubles the next one.
    pub fn delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(RX_BACKOFF_MAX);
        d
    }

    /// The delay that would be applied now, without escalating.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = RX_BACKOFF_MIN;
    }
}

impl Default for RxBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A running backend: its transmit funnel and receive loop.
pub struct BackendHandle {
    send: Arc<AsyncTx>,
    rx_task: Option<JoinHandle<()>>,
}

impl BackendHandle {
    pub(crate) fn new(send: Arc<AsyncTx>, rx_task: JoinHandle<()>) -> Self {
        Self {
            send,
            rx_task: Some(rx_task),
        }
    }

    /// The frame sink the server forwards client frames into.
    pub fn sink(&self) -> Arc<dyn FrameSink> {
        Arc::clone(&self.send) as Arc<dyn FrameSink>
    }

    /// Take the receive-loop handle (first caller wins).
    ///
    /// The task finishes on cancellation or on fatal device failure; the
    /// binary watches it to turn device disappearance into gateway
    /// termination.
    pub fn take_rx_task(&mut self) -> Option<JoinHandle<()>> {
        self.rx_task.take()
    }

    /// Stop the transmit funnel, draining queued frames.
    pub async fn close(&self) {
        self.send.close().await;
    }
}

/// Open the configured backend and start its receive loop.
pub async fn init_backend(
    cancel: watch::Receiver<bool>,
    cfg: &AppConfig,
    hub: Arc<Hub>,
) -> Result<BackendHandle> {
    match cfg.backend {
        BackendKind::Serial => serial::init(cancel, cfg, hub).await,
        #[cfg(target_os = "linux")]
        BackendKind::Socketcan => socketcan::init(cancel, cfg, hub),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Socketcan => Err(crate::core::error::GatewayError::Config(
            "socketcan backend requires linux".to_string(),
        )),
    }
}

/// Whether a read error means the device itself is gone (fatal) rather than
/// a transient failure worth backing off on.
pub(crate) fn is_device_gone(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::NotFound {
        return true;
    }
    // ENXIO / ENODEV: device unplugged or driver torn down.
    matches!(e.raw_os_error(), Some(6) | Some(19))
}
