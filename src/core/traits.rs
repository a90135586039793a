//! Capability traits at the gateway's seams.
//!
//! The server depends on small capability sets rather than one fat codec
//! interface:
//!
//! ```text
//! FrameDecoder      // decode one frame; decode_n provided on top of it
//! FrameBatchEncoder // encode to bytes; encode_to provided on top of it
//! FrameSink         // accept a frame for transmission toward the backend
//! FrameTransmitter  // the device-write seam consumed by the async TX worker
//! ```
//!
//! Optional capabilities are provided methods: a codec that can do better
//! than the generic rendering (multi-frame draining, writer-targeted
//! encoding) overrides them; the server always calls the optimistic method
//! and the default body is the fallback path.

use std::future::Future;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::core::error::{CodecError, CodecResult, Result};
use crate::core::frame::CanFrame;

/// Decodes CAN frames from a byte stream.
pub trait FrameDecoder: Send + Sync + 'static {
    /// Decode exactly one frame.
    ///
    /// Returns [`CodecError::Eof`] on a clean end of stream at a frame
    /// boundary.
    fn decode<R>(&self, r: &mut R) -> impl Future<Output = CodecResult<CanFrame>> + Send
    where
        R: AsyncRead + Unpin + Send;

    /// Decode up to `max` frames (`0` = until end of stream), appending each
    /// to `out` in decode order.
    ///
    /// Returns the number of frames decoded by this call. A clean end of
    /// stream returns `Ok(n)` with `n < max`; any other decode error
    /// propagates, with already-decoded frames left in `out`.
    fn decode_n<R>(
        &self,
        r: &mut R,
        max: usize,
        out: &mut Vec<CanFrame>,
    ) -> impl Future<Output = CodecResult<usize>> + Send
    where
        R: AsyncRead + Unpin + Send,
    {
        async move {
            let mut n = 0usize;
            while max == 0 || n < max {
                match self.decode(r).await {
                    Ok(frame) => {
                        out.push(frame);
                        n += 1;
                    }
                    Err(CodecError::Eof) => return Ok(n),
                    Err(e) => return Err(e),
                }
            }
            Ok(n)
        }
    }
}

/// Encodes batches of CAN frames.
pub trait FrameBatchEncoder: Send + Sync + 'static {
    /// Encode a batch into a byte vector.
    fn encode(&self, frames: &[CanFrame]) -> Vec<u8>;

    /// Encode a batch directly to a writer, returning bytes written.
    ///
    /// Must produce output byte-identical to [`encode`](Self::encode) for
    /// the same input. The default body is the byte-producing fallback.
    fn encode_to<W>(
        &self,
        w: &mut W,
        frames: &[CanFrame],
    ) -> impl Future<Output = std::io::Result<usize>> + Send
    where
        W: AsyncWrite + Unpin + Send,
    {
        async move {
            let buf = self.encode(frames);
            w.write_all(&buf).await?;
            Ok(buf.len())
        }
    }
}

/// A generic CAN frame transmission target.
///
/// Enqueue is non-blocking; a full transmit queue reports
/// [`GatewayError::TxOverflow`](crate::core::error::GatewayError::TxOverflow)
/// and a closed funnel reports
/// [`GatewayError::TxClosed`](crate::core::error::GatewayError::TxClosed).
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: CanFrame) -> Result<()>;
}

/// The device-write seam consumed by the async TX worker.
///
/// Uses `async_trait` because the worker holds it as a boxed object.
#[async_trait]
pub trait FrameTransmitter: Send + 'static {
    /// Write one frame to the device.
    async fn transmit(&mut self, frame: &CanFrame) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal decoder: 1-byte id, 1-byte len, payload. Exercises the
    /// provided `decode_n` body.
    struct TinyCodec;

    impl FrameDecoder for TinyCodec {
        async fn decode<R>(&self, r: &mut R) -> CodecResult<CanFrame>
        where
            R: AsyncRead + Unpin + Send,
        {
            use tokio::io::AsyncReadExt;
            let mut hdr = [0u8; 1];
            if r.read(&mut hdr).await? == 0 {
                return Err(CodecError::Eof);
            }
            let mut lenb = [0u8; 1];
            r.read_exact(&mut lenb).await?;
            let mut payload = vec![0u8; lenb[0] as usize];
            r.read_exact(&mut payload).await?;
            Ok(CanFrame::new(hdr[0] as u32, &payload))
        }
    }

    impl FrameBatchEncoder for TinyCodec {
        fn encode(&self, frames: &[CanFrame]) -> Vec<u8> {
            let mut out = Vec::new();
            for f in frames {
                out.push(f.can_id as u8);
                out.push(f.len);
                out.extend_from_slice(f.payload());
            }
            out
        }
    }

    #[tokio::test]
    async fn test_decode_n_default_stops_at_eof() {
        let codec = TinyCodec;
        let bytes = [0x01u8, 1, 0xAA, 0x02, 0, 0x03, 2, 0xBB, 0xCC];
        let mut src = &bytes[..];
        let mut out = Vec::new();

        let n = codec.decode_n(&mut src, 16, &mut out).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].can_id, 1);
        assert_eq!(out[2].payload(), &[0xBB, 0xCC]);
    }

    #[tokio::test]
    async fn test_decode_n_honors_max() {
        let codec = TinyCodec;
        let bytes = [0x01u8, 0, 0x02, 0, 0x03, 0];
        let mut src = &bytes[..];
        let mut out = Vec::new();

        let n = codec.decode_n(&mut src, 2, &mut out).await.unwrap();
        assert_eq!(n, 2);

        let n = codec.decode_n(&mut src, 2, &mut out).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn test_encode_to_default_matches_encode() {
        let codec = TinyCodec;
        let frames = vec![CanFrame::new(1, &[9, 8]), CanFrame::new(2, &[])];
        let expect = codec.encode(&frames);

        let mut sink = Vec::new();
        let n = codec.encode_to(&mut sink, &frames).await.unwrap();
        assert_eq!(n, expect.len());
        assert_eq!(sink, expect);
    }
}
