//! # CAN Gateway (cangw)
//!
//! A gateway bridging one CAN backend to many TCP subscribers using the
//! Cannelloni frame-packing wire format.
//!
//! ## Architecture
//!
//! - **Backends**: a serial UART adapter (vendor envelope with preamble and
//!   checksum) or a SocketCAN raw socket. One backend per process.
//! - **Hub**: fan-out of every received CAN frame to N clients under bounded
//!   per-client buffers, with `drop` or `kick` backpressure.
//! - **Server**: TCP listener, `CANNELLONIv1` handshake, per-client reader
//!   and batching writer, graceful shutdown.
//! - **Async TX**: a bounded non-blocking funnel serializing all device
//!   writes through one worker.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cangw::prelude::*;
//!
//! let hub = Arc::new(Hub::with_config(512, BackpressurePolicy::Drop));
//! let server = Server::new(ServerConfig::default(), hub, CannelloniCodec, sink);
//! server.serve(cancel).await?;
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod core;
pub mod hub;
pub mod server;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::codec::{CannelloniCodec, UartCodec};
    pub use crate::core::error::{GatewayError, Result};
    pub use crate::core::frame::CanFrame;
    pub use crate::core::traits::{FrameBatchEncoder, FrameDecoder, FrameSink};
    pub use crate::hub::{BackpressurePolicy, Client, Hub};
    pub use crate::server::{Server, ServerConfig};
}

// Re-export core types at crate root for convenience
pub use crate::core::error::{CodecError, GatewayError, HandshakeError, Result};
pub use crate::core::frame::CanFrame;
pub use crate::core::metrics::{is_ready, metrics, set_readiness_fn, Snapshot};
pub use crate::hub::{BackpressurePolicy, Client, Hub};
pub use crate::server::{Server, ServerConfig, HELLO};
