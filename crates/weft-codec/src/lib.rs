//! Wire format for the weft RPC framework: a chunked byte buffer, the
//! framed binary protocol (11-byte header + body), and a type-dispatched
//! serializer for scalars, strings and the standard containers.

mod buffer;
mod error;
mod frame;
mod serialize;

pub use buffer::ByteBuffer;
pub use error::CodecError;
pub use frame::{Frame, FrameHeader, HEADER_LEN, MAGIC, MsgType, VERSION};
pub use serialize::{Decode, Encode, Serializer};
