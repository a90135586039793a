//! Per-client reader: TCP socket -> backend transmit funnel.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::core::error::GatewayError;
use crate::core::frame::CanFrame;
use crate::core::traits::FrameDecoder;
use crate::hub::Client;

use super::{ServerInner, TaskGuard, READ_BATCH};

/// Pause when a deadline pass produced nothing, so a pathologically short
/// read deadline cannot spin the loop hot.
const IDLE_PAUSE: Duration = Duration::from_micros(100);

/// Pull frames from one TCP connection until the stream ends, a decode error
/// terminates it, or shutdown is signalled.
///
/// A deadline-caused timeout is non-fatal; frames decoded before it expired
/// are still dispatched. On exit the client's closure signal fires so the
/// writer tears the connection down.
pub(crate) async fn run_reader<C>(
    inner: Arc<ServerInner<C>>,
    mut rd: OwnedReadHalf,
    client: Arc<Client>,
    mut cancel: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
    conn_id: u64,
    _task: TaskGuard,
) where
    C: FrameDecoder,
{
    let mut closed = client.closed();
    let mut batch: Vec<CanFrame> = Vec::with_capacity(READ_BATCH);

    loop {
        batch.clear();
        let outcome = {
            let decode = inner.codec.decode_n(&mut rd, READ_BATCH, &mut batch);
            tokio::select! {
                biased;
                _ = cancel.wait_for(|c| *c) => break,
                _ = stop.wait_for(|s| *s) => break,
                _ = closed.wait_for(|c| *c) => break,
                res = tokio::time::timeout(inner.cfg.read_deadline, decode) => res,
            }
        };

        match outcome {
            // Read deadline expired; keep the connection.
            Err(_elapsed) => {
                let idle = batch.is_empty();
                inner.dispatch_frames(&batch, conn_id);
                if idle {
                    tokio::time::sleep(IDLE_PAUSE).await;
                }
            }
            Ok(Ok(n)) => {
                inner.dispatch_frames(&batch, conn_id);
                if n < READ_BATCH {
                    // Clean end of stream.
                    debug!(conn_id, "conn_eof");
                    break;
                }
            }
            Ok(Err(e)) if e.is_timeout() => {
                inner.dispatch_frames(&batch, conn_id);
            }
            Ok(Err(e)) => {
                // Frames decoded before the failure still count.
                inner.dispatch_frames(&batch, conn_id);
                let err = GatewayError::ConnRead(e);
                inner.record_error(&err);
                error!(conn_id, error = %err, "conn_read_error");
                break;
            }
        }
    }

    // Wake the writer so teardown (socket close, hub removal) happens there.
    client.close();
}
