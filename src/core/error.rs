//! Error types for the gateway.
//!
//! The taxonomy mirrors what callers need to distinguish: listener lifecycle
//! failures, per-connection read/write failures, handshake outcomes, backend
//! transmit overflow vs. real I/O failure, and per-frame codec violations.
//! Overflow is expected under load and is handled locally (debug log +
//! counter); codec violations terminate a TCP connection because the stream
//! carries no framing to resync on, while the serial decoder resyncs in
//! place.

use thiserror::Error;

use crate::core::metrics::ErrorLabel;

/// Convenience result alias used across the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Result alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Top-level gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Failed to bind the TCP listener.
    #[error("listen: {0}")]
    Listen(#[source] std::io::Error),

    /// Fatal listener accept failure.
    #[error("accept: {0}")]
    Accept(#[source] std::io::Error),

    /// Client hello exchange failed.
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    /// Per-connection socket read or decode failure.
    #[error("conn read: {0}")]
    ConnRead(#[source] CodecError),

    /// Per-connection socket write failure.
    #[error("conn write: {0}")]
    ConnWrite(#[source] std::io::Error),

    /// Backend transmit queue is full; the frame was dropped.
    ///
    /// Expected under load. Never surfaced to the TCP peer.
    #[error("backend tx overflow")]
    TxOverflow,

    /// Backend transmit funnel has been closed.
    #[error("backend tx closed")]
    TxClosed,

    /// Backend device I/O failure.
    #[error("backend: {0}")]
    Backend(#[source] std::io::Error),

    /// Frame parse failure outside a connection context.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),

    /// Cooperative shutdown interrupted the operation.
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Map to the error-counter label this failure is accounted under.
    ///
    /// Returns `None` for kinds outside the closed label set (cancellation,
    /// overflow sentinels accounted by their backend hooks, config errors).
    pub fn metric_label(&self) -> Option<ErrorLabel> {
        match self {
            Self::ConnRead(_) | Self::Codec(_) => Some(ErrorLabel::TcpRead),
            Self::ConnWrite(_) => Some(ErrorLabel::TcpWrite),
            Self::Handshake(_) => Some(ErrorLabel::Handshake),
            Self::Backend(_) => Some(ErrorLabel::SerialWrite),
            // Listener failures have no dedicated label; the original server
            // accounted them under the read-side label.
            Self::Listen(_) | Self::Accept(_) => Some(ErrorLabel::TcpRead),
            Self::TxOverflow | Self::TxClosed | Self::Config(_) | Self::Cancelled => None,
        }
    }
}

/// Handshake failure kinds.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer sent something other than the magic token.
    #[error("bad hello")]
    BadHello,

    /// The exchange did not complete within the handshake timeout.
    #[error("timeout")]
    Timeout,

    /// Socket I/O failed during the exchange.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-frame codec failure kinds.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Declared payload length exceeds the classic CAN maximum.
    #[error("invalid length {0}")]
    InvalidLength(u8),

    /// The stream ended in the middle of a frame.
    #[error("truncated frame")]
    Truncated,

    /// Envelope checksum mismatch.
    #[error("checksum mismatch")]
    Checksum,

    /// Clean end of stream at a frame boundary.
    #[error("end of stream")]
    Eof,

    /// Underlying I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether this error came from a read-deadline expiry rather than a
    /// protocol violation or terminal stream failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        )
    }
}
