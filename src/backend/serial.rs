//! Serial UART backend.
//!
//! The receive loop reads raw chunks into the UART accumulator and
//! broadcasts every decoded frame; transmit goes through the shared
//! [`AsyncTx`] funnel so many TCP readers never block behind the port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};

use crate::codec::uart::{RxAccumulator, UartCodec};
use crate::config::AppConfig;
use crate::core::error::{GatewayError, Result};
use crate::core::frame::CanFrame;
use crate::core::metrics::{self, ErrorLabel};
use crate::core::traits::FrameTransmitter;
use crate::hub::Hub;
use crate::transport::{AsyncTx, TxHooks};

use super::{
    is_device_gone, BackendHandle, RxBackoff, LARGE_BUFFER_RECLAIM, SERIAL_READ_BUF,
    TX_QUEUE_SIZE,
};

/// Open the serial device and start the RX loop.
pub(crate) async fn init(
    cancel: watch::Receiver<bool>,
    cfg: &AppConfig,
    hub: Arc<Hub>,
) -> Result<BackendHandle> {
    let stream = tokio_serial::new(&cfg.serial_dev, cfg.baud)
        .timeout(Duration::from_millis(cfg.serial_read_timeout_ms))
        .open_native_async()
        .map_err(|e| GatewayError::Backend(std::io::Error::other(e)))?;
    info!(device = %cfg.serial_dev, baud = cfg.baud, "serial_open");

    let (rd, wr) = tokio::io::split(stream);
    let send = Arc::new(AsyncTx::new(
        cancel.clone(),
        TX_QUEUE_SIZE,
        Box::new(SerialTransmitter {
            wr,
            codec: UartCodec,
        }),
        hooks(),
    ));
    let rx_task = spawn_rx(cancel, rd, hub);
    Ok(BackendHandle::new(send, rx_task))
}

fn hooks() -> TxHooks {
    TxHooks {
        on_error: Some(Box::new(|e| {
            metrics::inc_error(ErrorLabel::SerialWrite);
            error!(error = %e, "serial_write_error");
        })),
        on_after: Some(Box::new(metrics::inc_serial_tx)),
        on_drop: Some(Box::new(|| {
            metrics::inc_error(ErrorLabel::SerialTxOverflow);
            GatewayError::TxOverflow
        })),
    }
}

/// Encodes frames into the UART envelope and writes them to the port.
struct SerialTransmitter<W> {
    wr: W,
    codec: UartCodec,
}

#[async_trait]
impl<W> FrameTransmitter for SerialTransmitter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn transmit(&mut self, frame: &CanFrame) -> Result<()> {
        let wire = self.codec.encode(frame);
        self.wr
            .write_all(&wire)
            .await
            .map_err(GatewayError::Backend)
    }
}

/// Spawn the serial RX loop: read chunks, drain decoded frames to the hub.
pub(crate) fn spawn_rx<R>(
    mut cancel: watch::Receiver<bool>,
    mut rd: R,
    hub: Arc<Hub>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let codec = UartCodec;
        let mut acc = RxAccumulator::new();
        let mut buf = vec![0u8; SERIAL_READ_BUF];
        let mut backoff = RxBackoff::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.wait_for(|c| *c) => break,
                res = rd.read(&mut buf) => res,
            };
            match read {
                Ok(0) => {
                    // Transient EOF; pace without escalating the backoff.
                    tokio::time::sleep(backoff.peek()).await;
                }
                Ok(n) => {
                    acc.extend(&buf[..n]);
                    codec.decode_stream(&mut acc, |fr| hub.broadcast(fr));
                    acc.reclaim_if_oversized(LARGE_BUFFER_RECLAIM);
                    backoff.reset();
                }
                Err(e) if is_device_gone(&e) => {
                    error!(error = %e, "serial_device_gone");
                    break;
                }
                Err(e) => {
                    metrics::inc_error(ErrorLabel::SerialRead);
                    let delay = backoff.delay();
                    warn!(error = %e, backoff_ms = delay.as_millis() as u64, "serial_read_error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        info!("serial_rx_end");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::uart::rx_wire;
    use crate::core::frame::{CAN_EFF_FLAG, CAN_EFF_MASK};
    use crate::hub::{BackpressurePolicy, Client};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_rx_loop_broadcasts_decoded_frames() {
        let hub = Arc::new(Hub::with_config(16, BackpressurePolicy::Drop));
        let client = Client::new(16);
        hub.add(Arc::clone(&client));
        let mut out = client.take_outbound().unwrap();

        let (mut port, gateway_side) = duplex(256);
        let (cancel_tx, cancel) = watch::channel(false);
        let task = spawn_rx(cancel, gateway_side, Arc::clone(&hub));

        port.write_all(&rx_wire(0x1E5A, &[0x11, 0x22])).await.unwrap();
        port.write_all(&rx_wire(0x2B, &[0x33])).await.unwrap();

        let first = tokio::time::timeout(Duration::from_millis(500), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.can_id, 0x1E5A | CAN_EFF_FLAG);
        assert_eq!(first.payload(), &[0x11, 0x22]);

        let second = tokio::time::timeout(Duration::from_millis(500), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.can_id, 0x2B | CAN_EFF_FLAG);

        cancel_tx.send_replace(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_rx_loop_survives_garbage() {
        let hub = Arc::new(Hub::with_config(16, BackpressurePolicy::Drop));
        let client = Client::new(16);
        hub.add(Arc::clone(&client));
        let mut out = client.take_outbound().unwrap();

        let (mut port, gateway_side) = duplex(256);
        let (cancel_tx, cancel) = watch::channel(false);
        let task = spawn_rx(cancel, gateway_side, Arc::clone(&hub));

        port.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        port.write_all(&rx_wire(0x77, &[0x01])).await.unwrap();

        let fr = tokio::time::timeout(Duration::from_millis(500), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fr.can_id & CAN_EFF_MASK, 0x77);

        cancel_tx.send_replace(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_transmitter_writes_uart_envelope() {
        let (mut port, gateway_side) = duplex(256);
        let mut tx = SerialTransmitter {
            wr: gateway_side,
            codec: UartCodec,
        };

        let frame = CanFrame::new(0x0102 | CAN_EFF_FLAG, &[0xAA]);
        tx.transmit(&frame).await.unwrap();

        let expect = UartCodec.encode(&frame);
        let mut got = vec![0u8; expect.len()];
        port.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn test_tx_overflow_counts_serial_overflow() {
        let (_cancel_tx, cancel) = watch::channel(false);
        // A transmitter that never completes keeps the queue full.
        let (_port, gateway_side) = duplex(1);
        let tx = AsyncTx::new(
            cancel,
            1,
            Box::new(StuckTransmitter { _wr: gateway_side }),
            hooks(),
        );

        let pre = metrics::metrics().error_count(ErrorLabel::SerialTxOverflow);
        // Fill the worker slot and the queue, then overflow.
        let mut overflowed = false;
        for _ in 0..8 {
            match tx.send_frame(CanFrame::new(1, &[])) {
                Ok(()) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(GatewayError::TxOverflow) => {
                    overflowed = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(overflowed);
        assert!(metrics::metrics().error_count(ErrorLabel::SerialTxOverflow) > pre);
    }

    struct StuckTransmitter {
        _wr: tokio::io::DuplexStream,
    }

    #[async_trait]
    impl FrameTransmitter for StuckTransmitter {
        async fn transmit(&mut self, _frame: &CanFrame) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}
