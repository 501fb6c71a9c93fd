//! Bit-exact message layouts (spec §4.2, §6). Grounded in the teacher's
//! manual byteorder-based (de)serialization style (`src/dns/buffer.rs`)
//! and the wire tables of `original_source/src/kelpie/ops` message
//! headers: a fixed header shared by every envelope, two command-body
//! shapes, and one status-reply shape.
mod envelope;

pub use envelope::{
    BufferBody, Command, MessageHeader, NetBufferRemote, SimpleBody, StatusBody, UserFlags,
    FIXED_HEADER_SIZE, NBR_SIZE,
};
