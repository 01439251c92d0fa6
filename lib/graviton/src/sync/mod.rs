//! Concurrency primitives: the reentrant multi-reader/single-writer lock,
//! manually signaled events and the bounded memory accountant.

pub mod event;
pub mod memory;
pub mod mrsw;

pub use self::event::Event;
pub use self::memory::MemoryAccountant;
pub use self::mrsw::MrswLock;
