//! Asynchronous frame transmission toward the backend device.
//!
//! [`AsyncTx`] funnels frame writes from many producers through a single
//! worker task. Enqueue is non-blocking: a full buffer invokes the
//! configured `on_drop` hook and returns its error (the overflow sentinel),
//! so producers are never stalled behind a slow or wedged device.
//!
//! Life-cycle:
//!
//! ```ignore
//! let tx = AsyncTx::new(cancel, 1024, transmitter, hooks);
//! tx.send_frame(frame)?;
//! tx.close().await;
//! ```
//!
//! After `close` returns, every queued frame has been handed to the device
//! and further `send_frame` calls report
//! [`GatewayError::TxClosed`]. Hooks let each backend keep its own metrics
//! and logging without duplicating the worker plumbing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::error::{GatewayError, Result};
use crate::core::frame::CanFrame;
use crate::core::traits::{FrameSink, FrameTransmitter};

/// Hooks customizing [`AsyncTx`] behavior.
#[derive(Default)]
pub struct TxHooks {
    /// Called when the device write fails; the frame is not retried.
    pub on_error: Option<Box<dyn Fn(&GatewayError) + Send + Sync>>,

    /// Called after each successful device write.
    pub on_after: Option<Box<dyn Fn() + Send + Sync>>,

    /// Called when the buffer is full; its error is returned from
    /// `send_frame`. If unset, the overflow is a silent best-effort drop.
    pub on_drop: Option<Box<dyn Fn() -> GatewayError + Send + Sync>>,
}

struct Shared {
    /// Guards the enqueue/close transition; `None` once closed.
    sender: Mutex<Option<mpsc::Sender<CanFrame>>>,
    closed: AtomicBool,
    hooks: TxHooks,
}

/// Single-consumer bounded frame funnel.
pub struct AsyncTx {
    shared: Arc<Shared>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AsyncTx {
    /// Spawn the worker with a buffer of `buf` frames.
    ///
    /// `cancel` aborts the worker without draining; [`close`](Self::close)
    /// drains the queue first.
    pub fn new(
        mut cancel: watch::Receiver<bool>,
        buf: usize,
        mut transmitter: Box<dyn FrameTransmitter>,
        hooks: TxHooks,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<CanFrame>(buf.max(1));
        let shared = Arc::new(Shared {
            sender: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            hooks,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.wait_for(|c| *c) => return,
                    fr = rx.recv() => match fr {
                        Some(fr) => fr,
                        None => return, // closed and drained
                    },
                };
                match transmitter.transmit(&frame).await {
                    Ok(()) => {
                        if let Some(after) = &worker_shared.hooks.on_after {
                            after();
                        }
                    }
                    Err(e) => {
                        if let Some(on_error) = &worker_shared.hooks.on_error {
                            on_error(&e);
                        }
                    }
                }
            }
        });

        Self {
            shared,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queue a frame for asynchronous transmission.
    ///
    /// Never blocks. Returns the drop-hook error when the buffer is full and
    /// [`GatewayError::TxClosed`] after [`close`](Self::close).
    pub fn send_frame(&self, frame: CanFrame) -> Result<()> {
        // Fast path so steady-state sends skip the lock once shut down.
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(GatewayError::TxClosed);
        }
        let guard = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return Err(GatewayError::TxClosed);
        };
        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => match &self.shared.hooks.on_drop {
                Some(on_drop) => Err(on_drop()),
                None => Ok(()),
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::TxClosed),
        }
    }

    /// Stop accepting frames, drain the queue and wait for the worker.
    ///
    /// Idempotent. A `send_frame` racing this call observes either success
    /// (the frame is drained) or `TxClosed`.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            // Already closed; still wait for a concurrent closer's worker.
            if let Some(handle) = self.worker.lock().await.take() {
                let _ = handle.await;
            }
            return;
        }
        // Dropping the sender under the lock ends the race with send_frame;
        // the worker then drains the queue and exits.
        self.shared
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl FrameSink for AsyncTx {
    fn send_frame(&self, frame: CanFrame) -> Result<()> {
        AsyncTx::send_frame(self, frame)
    }
}
