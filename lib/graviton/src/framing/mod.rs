//! Protocol framing: the TCP partial-packet state machines and the UDP
//! packet-routing modes, plus the dispatcher they share.

pub mod tcp;
pub mod udp;

use crate::packet::Packet;
use crate::support::NetResult;
use crate::sync::MemoryAccountant;
use std::collections::VecDeque;
use std::sync::Arc;

/// Synchronous receive callback. When registered, completed packets are
/// handed to it on the completion worker instead of being queued.
pub type RecvCallback = Arc<dyn Fn(&mut Packet) + Send + Sync>;

/// FIFO of completed packets bounded by a memory accountant. A refused
/// charge surfaces to the caller, which tears the connection down.
pub struct PacketQueue {
    queue: VecDeque<Packet>,
    accountant: Arc<MemoryAccountant>,
}

impl PacketQueue {
    pub fn new(accountant: Arc<MemoryAccountant>) -> PacketQueue {
        PacketQueue {
            queue: VecDeque::new(),
            accountant,
        }
    }

    /// Charges the packet's storage and queues it.
    pub fn push(&mut self, packet: Packet) -> NetResult<()> {
        self.accountant.increase(packet.capacity())?;
        self.queue.push_back(packet);
        Ok(())
    }

    /// Removes the oldest packet, releasing its charge.
    pub fn pop(&mut self) -> Option<Packet> {
        let packet = self.queue.pop_front()?;
        self.accountant.decrease(packet.capacity());
        Some(packet)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drops everything, releasing all charges.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }
}

impl Drop for PacketQueue {
    fn drop(&mut self) {
        self.clear();
    }
}
