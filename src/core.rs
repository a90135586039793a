//! Core abstractions for the CAN gateway.
//!
//! Frame value type, error taxonomy, capability traits and the process-wide
//! metrics surface shared by every subsystem.

pub mod error;
pub mod frame;
pub mod metrics;
pub mod traits;

pub use error::{CodecError, CodecResult, GatewayError, HandshakeError, Result};
pub use frame::{
    CanFrame, CAN_EFF_FLAG, CAN_EFF_MASK, CAN_ERR_FLAG, CAN_MAX_DLC, CAN_RTR_FLAG, CAN_SFF_MASK,
};
pub use traits::{FrameBatchEncoder, FrameDecoder, FrameSink, FrameTransmitter};
