//! Per-client writer: hub outbound queue -> TCP socket, batching.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::core::error::{GatewayError, Result};
use crate::core::frame::CanFrame;
use crate::core::metrics;
use crate::core::traits::FrameBatchEncoder;
use crate::hub::Client;

use super::{ServerInner, TaskGuard};

/// Push hub frames to one TCP connection.
///
/// Flushes when the batch reaches the configured size, when the flush timer
/// fires, or (best-effort) when the client's closure signal or shutdown
/// fires. Owns teardown: closes the socket, removes the client from the hub
/// and counts the disconnect.
pub(crate) async fn run_writer<C>(
    inner: Arc<ServerInner<C>>,
    mut wr: OwnedWriteHalf,
    client: Arc<Client>,
    mut cancel: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
    conn_id: u64,
    _task: TaskGuard,
) where
    C: FrameBatchEncoder,
{
    let mut closed = client.closed();
    let mut ticker = tokio::time::interval(inner.cfg.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut batch: Vec<CanFrame> = Vec::with_capacity(inner.cfg.batch_size);

    if let Some(mut out) = client.take_outbound() {
        loop {
            tokio::select! {
                fr = out.recv() => match fr {
                    Some(fr) => {
                        batch.push(fr);
                        if batch.len() >= inner.cfg.batch_size
                            && flush(&inner, &mut wr, &mut batch, conn_id).await.is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if flush(&inner, &mut wr, &mut batch, conn_id).await.is_err() {
                        break;
                    }
                }
                _ = wait_true(&mut closed) => {
                    let _ = flush(&inner, &mut wr, &mut batch, conn_id).await;
                    break;
                }
                _ = wait_true(&mut cancel) => {
                    let _ = flush(&inner, &mut wr, &mut batch, conn_id).await;
                    break;
                }
                _ = wait_true(&mut stop) => {
                    let _ = flush(&inner, &mut wr, &mut batch, conn_id).await;
                    break;
                }
            }
        }
    }

    let _ = wr.shutdown().await;
    drop(wr);
    client.close();
    inner.hub.remove(&client);
    inner.forget_client(&client);
    inner.counters.disconnected.fetch_add(1, Ordering::Relaxed);
    info!(conn_id, "client_disconnected");
}

/// Await a `watch::Receiver<bool>` becoming `true`, without holding the
/// channel's internal read guard across other `select!` branches' awaits
/// (unlike `Receiver::wait_for`, whose `Ref` guard is not `Send`).
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

/// Write the batch with the codec's writer-targeted encoder; the codec's
/// byte-producing fallback applies when it has no direct rendering.
async fn flush<C>(
    inner: &ServerInner<C>,
    wr: &mut OwnedWriteHalf,
    batch: &mut Vec<CanFrame>,
    conn_id: u64,
) -> Result<()>
where
    C: FrameBatchEncoder,
{
    if batch.is_empty() {
        return Ok(());
    }
    let n = batch.len();
    let res = inner.codec.encode_to(wr, batch).await;
    batch.clear();
    match res {
        Ok(_written) => {
            metrics::add_tcp_tx(n);
            Ok(())
        }
        Err(e) => {
            let err = GatewayError::ConnWrite(e);
            inner.record_error(&err);
            error!(conn_id, error = %err, "conn_write_error");
            Err(err)
        }
    }
}
