//! SocketCAN raw-socket backend (Linux).
//!
//! The socket is nonblocking; the receive loop polls it on a short interval
//! and drains every available frame per tick, so a blocked bus read can
//! never pin a runtime worker. Transmit goes through the shared [`AsyncTx`]
//! funnel.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::core::error::{GatewayError, Result};
use crate::core::frame::{CanFrame, CAN_EFF_FLAG, CAN_RTR_FLAG};
use crate::core::metrics::{self, ErrorLabel};
use crate::core::traits::FrameTransmitter;
use crate::hub::Hub;
use crate::transport::{AsyncTx, TxHooks};

use super::{
    is_device_gone, BackendHandle, RxBackoff, SOCKETCAN_POLL_INTERVAL, TX_QUEUE_SIZE,
};

/// The minimal device surface needed by the RX loop and the TX writer.
/// Implemented by [`SocketCanDevice`] in production and by fakes in tests.
pub(crate) trait CanDevice: Send + Sync + 'static {
    fn read_frame(&self) -> io::Result<CanFrame>;
    fn write_frame(&self, frame: &CanFrame) -> io::Result<()>;
}

/// A raw CAN socket bound to one interface.
pub struct SocketCanDevice {
    socket: CanSocket,
}

impl SocketCanDevice {
    /// Open and bind the interface, switching the socket to nonblocking.
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(GatewayError::Backend)?;
        socket
            .set_nonblocking(true)
            .map_err(GatewayError::Backend)?;
        Ok(Self { socket })
    }
}

impl CanDevice for SocketCanDevice {
    fn read_frame(&self) -> io::Result<CanFrame> {
        let frame = self.socket.read_frame()?;
        let mut id = frame.raw_id();
        if frame.is_extended() {
            id |= CAN_EFF_FLAG;
        }
        if frame.is_remote_frame() {
            id |= CAN_RTR_FLAG;
        }
        Ok(CanFrame::new(id, frame.data()))
    }

    fn write_frame(&self, frame: &CanFrame) -> io::Result<()> {
        let wire = to_socket_frame(frame).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "unrepresentable CAN frame")
        })?;
        self.socket.write_frame(&wire)
    }
}

/// Render our frame as a socketcan frame; `None` if the identifier does not
/// fit its format.
fn to_socket_frame(frame: &CanFrame) -> Option<socketcan::CanFrame> {
    if frame.is_extended() {
        let id = ExtendedId::new(frame.id_value())?;
        if frame.is_rtr() {
            socketcan::CanFrame::new_remote(id, frame.len as usize)
        } else {
            socketcan::CanFrame::new(id, frame.payload())
        }
    } else {
        let id = StandardId::new(frame.id_value() as u16)?;
        if frame.is_rtr() {
            socketcan::CanFrame::new_remote(id, frame.len as usize)
        } else {
            socketcan::CanFrame::new(id, frame.payload())
        }
    }
}

/// Open the configured interface and start the RX loop.
pub(crate) fn init(
    cancel: watch::Receiver<bool>,
    cfg: &AppConfig,
    hub: Arc<Hub>,
) -> Result<BackendHandle> {
    let dev = Arc::new(SocketCanDevice::open(&cfg.can_if)?);
    info!(interface = %cfg.can_if, "socketcan_open");

    let send = Arc::new(AsyncTx::new(
        cancel.clone(),
        TX_QUEUE_SIZE,
        Box::new(SocketCanTransmitter {
            dev: Arc::clone(&dev),
        }),
        hooks(),
    ));
    let rx_task = spawn_rx(cancel, dev, hub);
    Ok(BackendHandle::new(send, rx_task))
}

fn hooks() -> TxHooks {
    TxHooks {
        on_error: Some(Box::new(|_| metrics::inc_error(ErrorLabel::SocketCanWrite))),
        on_after: Some(Box::new(metrics::inc_socketcan_tx)),
        on_drop: Some(Box::new(|| {
            metrics::inc_error(ErrorLabel::SocketCanTxOverflow);
            GatewayError::TxOverflow
        })),
    }
}

struct SocketCanTransmitter<D> {
    dev: Arc<D>,
}

#[async_trait]
impl<D: CanDevice> FrameTransmitter for SocketCanTransmitter<D> {
    async fn transmit(&mut self, frame: &CanFrame) -> Result<()> {
        self.dev.write_frame(frame).map_err(GatewayError::Backend)
    }
}

/// Spawn the polling RX loop: drain all available frames per tick and
/// broadcast them.
pub(crate) fn spawn_rx<D: CanDevice>(
    mut cancel: watch::Receiver<bool>,
    dev: Arc<D>,
    hub: Arc<Hub>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut poll = tokio::time::interval(SOCKETCAN_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut backoff = RxBackoff::new();

        'outer: loop {
            tokio::select! {
                biased;
                _ = cancel.wait_for(|c| *c) => break,
                _ = poll.tick() => {}
            }
            loop {
                match dev.read_frame() {
                    Ok(frame) => {
                        metrics::inc_socketcan_rx();
                        hub.broadcast(frame);
                        backoff.reset();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if is_device_gone(&e) => {
                        error!(error = %e, "socketcan_device_gone");
                        break 'outer;
                    }
                    Err(e) => {
                        metrics::inc_error(ErrorLabel::SocketCanRead);
                        let delay = backoff.delay();
                        warn!(error = %e, backoff_ms = delay.as_millis() as u64, "socketcan_read_error");
                        tokio::time::sleep(delay).await;
                        break;
                    }
                }
            }
        }
        info!("socketcan_rx_end");
    })
}
