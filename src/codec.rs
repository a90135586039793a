//! Wire codecs.
//!
//! [`cannelloni`] carries CAN frames over TCP; [`uart`] carries them over the
//! serial adapter link with a preamble/length/checksum envelope.

pub mod cannelloni;
pub mod uart;

pub use cannelloni::CannelloniCodec;
pub use uart::{RxAccumulator, UartCodec};
