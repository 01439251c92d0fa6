use crate::packet::Packet;
use crate::support::NetResult;
use crate::sync::MemoryAccountant;
use std::sync::{Arc, Mutex};

/// A bounded cache of same-capacity packets that saves allocator churn on
/// the receive path.
///
/// The bin is pre-filled at construction and its storage is charged against
/// the shared accountant up front; packets that cycle through the bin cost
/// nothing further. Requests the bin cannot serve fall back to a fresh
/// allocation.
#[derive(Debug)]
pub struct MemoryRecycle {
    bin: Mutex<Vec<Packet>>,
    max_packets: usize,
    packet_size: usize,
    accountant: Arc<MemoryAccountant>,
}

impl MemoryRecycle {
    /// A pool of `max_packets` packets of `packet_size` bytes each. The
    /// pooled storage is charged to `accountant` immediately; a refused
    /// charge fails construction.
    pub fn new(
        max_packets: usize,
        packet_size: usize,
        accountant: Arc<MemoryAccountant>,
    ) -> NetResult<MemoryRecycle> {
        accountant.increase(max_packets * packet_size)?;

        let bin = (0..max_packets)
            .map(|_| Packet::with_capacity(packet_size))
            .collect();

        Ok(MemoryRecycle {
            bin: Mutex::new(bin),
            max_packets,
            packet_size,
            accountant,
        })
    }

    /// A pool that recycles nothing; every acquire allocates fresh.
    pub fn disabled(accountant: Arc<MemoryAccountant>) -> MemoryRecycle {
        MemoryRecycle {
            bin: Mutex::new(Vec::new()),
            max_packets: 0,
            packet_size: 0,
            accountant,
        }
    }

    #[inline]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Number of packets currently waiting in the bin.
    pub fn pooled(&self) -> usize {
        self.bin.lock().unwrap().len()
    }

    #[inline]
    pub fn accountant(&self) -> &Arc<MemoryAccountant> {
        &self.accountant
    }

    /// Returns a packet with at least `size` bytes of capacity: a pooled one
    /// when `size` fits the pool's packet size and the bin is non-empty, a
    /// fresh allocation otherwise.
    pub fn acquire(&self, size: usize) -> Packet {
        if size <= self.packet_size {
            if let Some(mut packet) = self.bin.lock().unwrap().pop() {
                packet.clear();
                return packet;
            }
        }

        Packet::with_capacity(size)
    }

    /// Takes a packet back. Pushed into the bin when there is room and the
    /// capacity matches the pool size; deallocated otherwise.
    pub fn release(&self, mut packet: Packet) {
        if packet.capacity() == self.packet_size {
            let mut bin = self.bin.lock().unwrap();
            if bin.len() < self.max_packets {
                packet.clear();
                packet.set_client_from(0);
                packet.set_operation(0);
                packet.set_instance(0);
                packet.set_age(0);
                bin.push(packet);
            }
        }
    }
}

impl Drop for MemoryRecycle {
    fn drop(&mut self) {
        self.accountant.decrease(self.max_packets * self.packet_size);
    }
}
