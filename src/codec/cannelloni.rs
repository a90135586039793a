//! Cannelloni frame-packing codec for the TCP side.
//!
//! Frames are concatenated with no packet-level framing or separators:
//!
//! ```text
//! +----------------+-----+-------------------+
//! | CAN id (4, BE) | LEN | payload (LEN)     |  repeated
//! +----------------+-----+-------------------+
//! ```
//!
//! The identifier carries the SocketCAN flag bits. Only the low 7 bits of the
//! length byte are significant; the high bit is reserved and masked on
//! decode. The codec is stateless and safe for concurrent use.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::{CodecError, CodecResult};
use crate::core::frame::{CanFrame, CAN_MAX_DLC};
use crate::core::metrics;
use crate::core::traits::{FrameBatchEncoder, FrameDecoder};

/// Worst-case wire size of a single encoded frame.
const MAX_FRAME_WIRE: usize = 4 + 1 + CAN_MAX_DLC;

/// Stateless Cannelloni codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct CannelloniCodec;

impl FrameDecoder for CannelloniCodec {
    /// Decode one frame.
    ///
    /// Returns [`CodecError::Eof`] when the stream ends at a frame boundary.
    /// A masked length above 8 fails with `InvalidLength`; a short payload
    /// read fails with `Truncated`. Both count one malformed frame.
    async fn decode<R>(&self, r: &mut R) -> CodecResult<CanFrame>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut idb = [0u8; 4];
        if r.read(&mut idb[..1]).await? == 0 {
            return Err(CodecError::Eof);
        }
        r.read_exact(&mut idb[1..]).await?;
        let can_id = u32::from_be_bytes(idb);

        let mut lb = [0u8; 1];
        if r.read(&mut lb).await? == 0 {
            return Err(CodecError::Eof);
        }
        let len = lb[0] & 0x7F; // high bit reserved (future flags?)
        if len as usize > CAN_MAX_DLC {
            metrics::inc_malformed();
            return Err(CodecError::InvalidLength(len));
        }

        let mut frame = CanFrame {
            can_id,
            len,
            data: [0u8; 64],
        };
        if len > 0 {
            if let Err(e) = r.read_exact(&mut frame.data[..len as usize]).await {
                metrics::inc_malformed();
                return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    CodecError::Truncated
                } else {
                    CodecError::Io(e)
                });
            }
        }
        Ok(frame)
    }
}

impl FrameBatchEncoder for CannelloniCodec {
    fn encode(&self, frames: &[CanFrame]) -> Vec<u8> {
        if frames.is_empty() {
            return Vec::new();
        }
        let mut buf = Vec::with_capacity(frames.len() * MAX_FRAME_WIRE);
        for f in frames {
            buf.extend_from_slice(&f.can_id.to_be_bytes());
            buf.push(f.len);
            let len = ((f.len & 0x7F) as usize).min(CAN_MAX_DLC);
            buf.extend_from_slice(&f.data[..len]);
        }
        buf
    }

    /// Writes each frame contiguously; output is byte-identical to
    /// [`encode`](FrameBatchEncoder::encode).
    async fn encode_to<W>(&self, w: &mut W, frames: &[CanFrame]) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut total = 0usize;
        let mut wire = [0u8; MAX_FRAME_WIRE];
        for f in frames {
            wire[..4].copy_from_slice(&f.can_id.to_be_bytes());
            wire[4] = f.len;
            let len = ((f.len & 0x7F) as usize).min(CAN_MAX_DLC);
            wire[5..5 + len].copy_from_slice(&f.data[..len]);
            w.write_all(&wire[..5 + len]).await?;
            total += 5 + len;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::CAN_EFF_FLAG;
    use crate::core::metrics::{metrics, COUNTER_TEST_LOCK};

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        COUNTER_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========== decode tests ==========

    #[tokio::test]
    async fn test_decode_single_frame() {
        let bytes = [0x00u8, 0x00, 0x01, 0x23, 0x03, 0x01, 0x02, 0x03];
        let mut src = &bytes[..];
        let codec = CannelloniCodec;

        let fr = codec.decode(&mut src).await.unwrap();
        assert_eq!(fr.can_id, 0x0000_0123);
        assert_eq!(fr.len, 3);
        assert_eq!(fr.payload(), &[0x01, 0x02, 0x03]);

        // Stream ends cleanly at the frame boundary.
        assert!(matches!(
            codec.decode(&mut src).await,
            Err(CodecError::Eof)
        ));
    }

    #[tokio::test]
    async fn test_decode_invalid_length() {
        let _g = lock();
        let bytes = [0x00u8, 0x00, 0x00, 0x01, 0x09];
        let mut src = &bytes[..];
        let pre = metrics().snapshot().malformed_frames;

        let err = CannelloniCodec.decode(&mut src).await.unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength(9)));
        assert_eq!(metrics().snapshot().malformed_frames, pre + 1);
    }

    #[tokio::test]
    async fn test_decode_truncated_payload() {
        let _g = lock();
        let bytes = [0x00u8, 0x00, 0x00, 0x02, 0x05, 0x01, 0x02, 0x03];
        let mut src = &bytes[..];
        let pre = metrics().snapshot().malformed_frames;

        let err = CannelloniCodec.decode(&mut src).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
        assert_eq!(metrics().snapshot().malformed_frames, pre + 1);
    }

    #[tokio::test]
    async fn test_decode_zero_length_payload() {
        let bytes = [0x00u8, 0x00, 0x00, 0x07, 0x00];
        let mut src = &bytes[..];

        let fr = CannelloniCodec.decode(&mut src).await.unwrap();
        assert_eq!(fr.can_id, 7);
        assert_eq!(fr.len, 0);
        assert!(fr.payload().is_empty());
    }

    #[tokio::test]
    async fn test_decode_masks_reserved_high_bit() {
        // Length byte 0x83 -> masked to 3.
        let bytes = [0x00u8, 0x00, 0x00, 0x01, 0x83, 0xAA, 0xBB, 0xCC];
        let mut src = &bytes[..];

        let fr = CannelloniCodec.decode(&mut src).await.unwrap();
        assert_eq!(fr.len, 3);
        assert_eq!(fr.payload(), &[0xAA, 0xBB, 0xCC]);
    }

    // ========== encode tests ==========

    #[test]
    fn test_encode_layout() {
        let frames = vec![CanFrame::new(0x123, &[1, 2, 3])];
        let bytes = CannelloniCodec.encode(&frames);
        assert_eq!(bytes, vec![0x00, 0x00, 0x01, 0x23, 0x03, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_encode_empty_batch() {
        assert!(CannelloniCodec.encode(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_encode_to_matches_encode() {
        let frames = vec![
            CanFrame::new(0x1 | CAN_EFF_FLAG, &[0xDE, 0xAD]),
            CanFrame::new(0x700, &[]),
            CanFrame::new(0x7FF, &[1, 2, 3, 4, 5, 6, 7, 8]),
        ];
        let codec = CannelloniCodec;
        let expect = codec.encode(&frames);

        let mut sink = Vec::new();
        let n = codec.encode_to(&mut sink, &frames).await.unwrap();
        assert_eq!(n, expect.len());
        assert_eq!(sink, expect);
    }

    // ========== round-trip ==========

    #[tokio::test]
    async fn test_roundtrip_multi_frame() {
        let want = vec![
            CanFrame::new(0x0001_E5A | CAN_EFF_FLAG, &[0x34, 0x7B, 0x70, 0xD7]),
            CanFrame::new(0x123, &[]),
            CanFrame::new(0x1FFF_FFFF | CAN_EFF_FLAG, &[1, 2, 3, 4, 5, 6, 7, 8]),
            CanFrame::new(0x42, &[0xFF]),
        ];
        let codec = CannelloniCodec;
        let wire = codec.encode(&want);

        let mut src = &wire[..];
        let mut got = Vec::new();
        let n = codec.decode_n(&mut src, 0, &mut got).await.unwrap();
        assert_eq!(n, want.len());
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn test_decode_n_propagates_errors() {
        let _g = lock();
        // One valid frame followed by an invalid length.
        let bytes = [
            0x00u8, 0x00, 0x00, 0x01, 0x01, 0xAA, // valid
            0x00, 0x00, 0x00, 0x02, 0x0B, // length 11
        ];
        let mut src = &bytes[..];
        let mut got = Vec::new();

        let err = CannelloniCodec
            .decode_n(&mut src, 16, &mut got)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength(11)));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload(), &[0xAA]);
    }
}
