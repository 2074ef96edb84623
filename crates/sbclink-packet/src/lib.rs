//! Typed packet codec for the sbclink SPI protocol.
//!
//! Transfer payloads carry a sequence of packets, each a fixed
//! little-endian record behind an 8-byte [`PacketHeader`], padded to 4-byte
//! boundaries. Host-to-firmware kinds live in [`Request`], firmware-to-host
//! kinds in [`Response`]; [`codec`] turns them into and out of payload
//! bytes. The crate also owns the [`Code`] model and its G-code parser,
//! since codes are the dominant packet body in both directions.

pub mod channel;
pub mod code;
pub mod codec;
pub mod error;
pub mod header;
pub mod requests;
pub mod responses;
pub mod wire;

pub use channel::{CodeChannel, CHANNEL_COUNT};
pub use code::{parse, Code, CodeParameter, CodeParseError, ParameterValue};
pub use codec::{encode_packet, packet_wire_len, PacketReader};
pub use error::{CodecError, Result};
pub use header::{PacketHeader, PACKET_HEADER_SIZE};
pub use requests::{PrintStopReason, Request, RequestKind};
pub use responses::{PauseReason, ReplyFlags, Response, ResponseKind};
