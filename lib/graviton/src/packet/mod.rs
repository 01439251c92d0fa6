//! The cursor-based packet buffer and its memory recycle pool.

mod buffer;
mod recycle;

pub use self::buffer::{Packet, Wire, PREFIX_SIZE};
pub use self::recycle::MemoryRecycle;
