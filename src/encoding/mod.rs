//! Packed integer encoding shared by the base-file codec and the
//! changes-stream writer.

mod varint;

pub use varint::{pack_uint, packed_len, unpack_uint};
