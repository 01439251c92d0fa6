//! UDP packet routing. Depending on the mode, received datagrams land in
//! per-target single-slot stores where the newest age wins, or in a plain
//! arrival-order queue.

use crate::framing::{PacketQueue, RecvCallback};
use crate::packet::{MemoryRecycle, Packet};
use crate::support::{raise, ErrorKind, NetResult};
use crate::sync::MemoryAccountant;
use lumen::{ClientId, InstanceId, OperationId};
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;

/// How received datagrams are routed to readers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum UdpMode {
    /// One slot per client; the newest packet wins.
    PerClient,
    /// One slot per (client, operation) pair.
    PerClientPerOp,
    /// No routing; datagrams queue in arrival order with no prefixes.
    CatchAll,
    /// Arrival-order queue that drops datagrams older than the last seen.
    CatchAllNoReorder,
}

impl UdpMode {
    /// Wire encoding used in the handshake's server-info frame.
    pub fn mode_byte(self) -> u8 {
        match self {
            UdpMode::PerClient => 1,
            UdpMode::PerClientPerOp => 2,
            UdpMode::CatchAll => 3,
            UdpMode::CatchAllNoReorder => 4,
        }
    }

    pub fn from_mode_byte(byte: u8) -> NetResult<UdpMode> {
        match byte {
            1 => Ok(UdpMode::PerClient),
            2 => Ok(UdpMode::PerClientPerOp),
            3 => Ok(UdpMode::CatchAll),
            4 => Ok(UdpMode::CatchAllNoReorder),
            _ => raise(ErrorKind::Protocol, "decoding a udp mode byte"),
        }
    }

    /// True for modes whose datagrams carry the 8-byte age stamp.
    pub fn uses_age(self) -> bool {
        !matches!(self, UdpMode::CatchAll)
    }
}

/// Builds the wire image of one outgoing datagram for `mode`.
///
/// `client` is included only on the server → client direction, where the
/// receiver cannot infer it; `operation` only in per-operation mode.
pub fn build_datagram(
    mode: UdpMode,
    age: u64,
    client: Option<ClientId>,
    operation: Option<OperationId>,
    payload: &[u8],
) -> Vec<u8> {
    if !mode.uses_age() {
        return payload.to_vec();
    }

    let mut wire = Vec::with_capacity(payload.len() + 24);
    wire.extend_from_slice(&age.to_le_bytes());
    if let Some(client) = client {
        wire.extend_from_slice(&(client as u64).to_le_bytes());
    }
    if let Some(operation) = operation {
        wire.extend_from_slice(&(operation as u64).to_le_bytes());
    }
    wire.extend_from_slice(payload);
    wire
}

struct Slot {
    packet: Packet,
    age: u64,
}

enum Store {
    PerClient {
        slots: Vec<Vec<Slot>>,
        per_operation: bool,
    },
    CatchAll {
        queue: PacketQueue,
    },
    CatchAllNoReorder {
        queue: PacketQueue,
        age: u64,
    },
}

/// Applies the age filter against a stored age. Accepting resets the stored
/// age when the incoming value is so far behind that the age counter must
/// have wrapped.
fn age_accepts(stored: &mut u64, incoming: u64) -> bool {
    if incoming <= *stored {
        if *stored - incoming > *stored / 2 {
            *stored = 0;
        } else {
            return false;
        }
    }
    true
}

/// Routes received datagrams per the configured [`UdpMode`].
pub struct UdpFramer {
    mode: UdpMode,
    store: Store,
    callback: Option<RecvCallback>,
    recycle: Arc<MemoryRecycle>,
    instance: InstanceId,
    num_clients: usize,
    num_operations: usize,
}

impl UdpFramer {
    /// `num_clients`/`num_operations` only matter to the per-client modes.
    /// The slot grid is `(num_clients + 1) x num_operations`: id 0 holds
    /// traffic whose embedded client id is 0 (a client receiving from the
    /// server).
    pub fn new(
        mode: UdpMode,
        recv_size: usize,
        num_clients: usize,
        num_operations: usize,
        recycle: Arc<MemoryRecycle>,
        recv_accountant: Arc<MemoryAccountant>,
        callback: Option<RecvCallback>,
        instance: InstanceId,
    ) -> UdpFramer {
        let num_operations = num_operations.max(1);

        let store = match mode {
            UdpMode::PerClient | UdpMode::PerClientPerOp => {
                let per_operation = mode == UdpMode::PerClientPerOp;
                let ops = if per_operation { num_operations } else { 1 };
                let slots = (0..=num_clients)
                    .map(|_| {
                        (0..ops)
                            .map(|_| Slot {
                                packet: Packet::with_capacity(recv_size),
                                age: 0,
                            })
                            .collect()
                    })
                    .collect();
                Store::PerClient {
                    slots,
                    per_operation,
                }
            }
            UdpMode::CatchAll => Store::CatchAll {
                queue: PacketQueue::new(recv_accountant),
            },
            UdpMode::CatchAllNoReorder => Store::CatchAllNoReorder {
                queue: PacketQueue::new(recv_accountant),
                age: 0,
            },
        };

        UdpFramer {
            mode,
            store,
            callback,
            recycle,
            instance,
            num_clients,
            num_operations,
        }
    }

    #[inline]
    pub fn mode(&self) -> UdpMode {
        self.mode
    }

    #[inline]
    pub fn num_clients(&self) -> usize {
        self.num_clients
    }

    #[inline]
    pub fn num_operations(&self) -> usize {
        match self.mode {
            UdpMode::PerClientPerOp => self.num_operations,
            _ => 1,
        }
    }

    /// Feeds one received datagram through the mode's routing. `client_hint`
    /// carries the sender's id when the caller already knows it (the server
    /// resolved the peer address); 0 means "extract it from the packet".
    ///
    /// Undersized datagrams are dropped silently; a datagram from the open
    /// internet must not be able to error a shared socket.
    pub fn deal_with_data(
        &mut self,
        datagram: &mut [u8],
        client_hint: ClientId,
    ) -> NetResult<()> {
        let instance = self.instance;

        match &mut self.store {
            Store::CatchAll { queue } => {
                let mut packet = self.recycle.acquire(datagram.len());
                packet.extend_from_slice(datagram)?;
                packet.set_client_from(client_hint);
                packet.set_instance(instance);
                match &self.callback {
                    Some(callback) => {
                        callback(&mut packet);
                        self.recycle.release(packet);
                        Ok(())
                    }
                    None => queue.push(packet),
                }
            }

            Store::CatchAllNoReorder { queue, age } => {
                let mut view = Packet::new();
                unsafe {
                    view.set_data_ptr(datagram.as_mut_ptr(), datagram.len(), datagram.len())
                };

                let stamp = match view.get_age_stamp() {
                    Ok(stamp) => stamp,
                    Err(_) => return Ok(()),
                };
                // Age 0 is a handshake packet, not data.
                if stamp == 0 {
                    return Ok(());
                }
                if !age_accepts(age, stamp) {
                    return Ok(());
                }
                *age = stamp;

                let payload = view.get_bytes(view.remaining())?;
                drop(view);

                let mut packet = self.recycle.acquire(payload.len());
                packet.extend_from_slice(&payload)?;
                packet.set_client_from(client_hint);
                packet.set_instance(instance);
                packet.set_age(stamp);
                match &self.callback {
                    Some(callback) => {
                        callback(&mut packet);
                        self.recycle.release(packet);
                        Ok(())
                    }
                    None => queue.push(packet),
                }
            }

            Store::PerClient {
                slots,
                per_operation,
            } => {
                let mut view = Packet::new();
                unsafe {
                    view.set_data_ptr(datagram.as_mut_ptr(), datagram.len(), datagram.len())
                };

                let stamp = match view.get_age_stamp() {
                    Ok(stamp) => stamp,
                    Err(_) => return Ok(()),
                };
                if stamp == 0 {
                    return Ok(());
                }

                let client = match client_hint {
                    0 => view.get_size()?,
                    known => known,
                };
                if client >= slots.len() {
                    return raise(
                        ErrorKind::OutOfBounds,
                        "routing a udp packet to a client slot",
                    );
                }

                let operation = if *per_operation {
                    let operation = view.get_size()?;
                    if operation >= slots[client].len() {
                        return raise(
                            ErrorKind::OutOfBounds,
                            "routing a udp packet to an operation slot",
                        );
                    }
                    operation
                } else {
                    0
                };

                let slot = &mut slots[client][operation];
                if !age_accepts(&mut slot.age, stamp) {
                    return Ok(());
                }
                slot.age = stamp;

                let payload = view.get_bytes(view.remaining())?;
                drop(view);

                match &self.callback {
                    Some(callback) => {
                        let mut packet = self.recycle.acquire(payload.len());
                        packet.extend_from_slice(&payload)?;
                        packet.set_client_from(client);
                        packet.set_operation(operation);
                        packet.set_instance(instance);
                        packet.set_age(stamp);
                        callback(&mut packet);
                        self.recycle.release(packet);
                    }
                    None => {
                        slot.packet.clear();
                        slot.packet.extend_from_slice(&payload)?;
                        slot.packet.set_client_from(client);
                        slot.packet.set_operation(operation);
                        slot.packet.set_instance(instance);
                        slot.packet.set_age(stamp);
                    }
                }
                Ok(())
            }
        }
    }

    fn validate_slot(&self, client: ClientId, operation: OperationId) -> NetResult<()> {
        match &self.store {
            Store::PerClient {
                slots,
                per_operation,
            } => {
                if client >= slots.len() {
                    return raise(ErrorKind::InvalidArgument, "addressing a client slot");
                }
                let ops = if *per_operation { slots[client].len() } else { 1 };
                if operation >= ops {
                    return raise(ErrorKind::InvalidArgument, "addressing an operation slot");
                }
                Ok(())
            }
            _ => raise(
                ErrorKind::InvalidState,
                "addressing slots of a catch-all udp framer",
            ),
        }
    }

    /// Number of packets waiting for `(client, operation)`: 0 or 1 in the
    /// per-client modes.
    pub fn packet_amount(&self, client: ClientId, operation: OperationId) -> NetResult<usize> {
        match &self.store {
            Store::PerClient { slots, per_operation } => {
                self.validate_slot(client, operation)?;
                let operation = if *per_operation { operation } else { 0 };
                Ok((slots[client][operation].packet.used() > 0) as usize)
            }
            Store::CatchAll { queue } | Store::CatchAllNoReorder { queue, .. } => {
                Ok(queue.len())
            }
        }
    }

    /// Moves the stored packet for `(client, operation)` out. The slot's age
    /// survives so stale datagrams stay filtered.
    pub fn read_slot(
        &mut self,
        client: ClientId,
        operation: OperationId,
    ) -> NetResult<Option<Packet>> {
        self.validate_slot(client, operation)?;

        match &mut self.store {
            Store::PerClient { slots, per_operation } => {
                let operation = if *per_operation { operation } else { 0 };
                let slot = &mut slots[client][operation];
                if slot.packet.used() == 0 {
                    return Ok(None);
                }

                let packet = slot.packet.clone();
                slot.packet.clear();
                Ok(Some(packet))
            }
            _ => unreachable!(),
        }
    }

    /// Takes the oldest queued packet (catch-all modes).
    pub fn get_packet(&mut self) -> Option<Packet> {
        match &mut self.store {
            Store::CatchAll { queue } | Store::CatchAllNoReorder { queue, .. } => queue.pop(),
            Store::PerClient { .. } => None,
        }
    }

    /// Clears a client's slots and ages; called when the slot is reassigned
    /// to a new connection.
    pub fn reset_client(&mut self, client: ClientId) {
        if let Store::PerClient { slots, .. } = &mut self.store {
            if let Some(row) = slots.get_mut(client) {
                for slot in row.iter_mut() {
                    slot.packet.clear();
                    slot.age = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<MemoryRecycle> {
        Arc::new(MemoryRecycle::disabled(Arc::new(MemoryAccountant::unbounded())))
    }

    fn datagram(age: u64, client: Option<u64>, op: Option<u64>, payload: &[u8]) -> Vec<u8> {
        build_datagram(
            UdpMode::PerClient,
            age,
            client.map(|c| c as usize),
            op.map(|o| o as usize),
            payload,
        )
    }

    fn per_client_framer() -> UdpFramer {
        UdpFramer::new(
            UdpMode::PerClient,
            512,
            8,
            1,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            None,
            1,
        )
    }

    #[test]
    fn test_mode_byte_roundtrip() {
        for mode in &[
            UdpMode::PerClient,
            UdpMode::PerClientPerOp,
            UdpMode::CatchAll,
            UdpMode::CatchAllNoReorder,
        ] {
            assert_eq!(UdpMode::from_mode_byte(mode.mode_byte()).unwrap(), *mode);
        }
        assert!(UdpMode::from_mode_byte(0).is_err());
    }

    #[test]
    fn test_per_client_stores_newest() {
        let mut framer = per_client_framer();

        framer
            .deal_with_data(&mut datagram(10, None, None, b"old"), 3)
            .unwrap();
        framer
            .deal_with_data(&mut datagram(20, None, None, b"new"), 3)
            .unwrap();

        assert_eq!(framer.packet_amount(3, 0).unwrap(), 1);
        let packet = framer.read_slot(3, 0).unwrap().unwrap();
        assert_eq!(packet.bytes(), b"new");
        assert_eq!(packet.age(), 20);
        assert_eq!(packet.client_from(), 3);
    }

    #[test]
    fn test_per_client_drops_stale_age() {
        let mut framer = per_client_framer();

        framer
            .deal_with_data(&mut datagram(20, None, None, b"fresh"), 3)
            .unwrap();
        framer
            .deal_with_data(&mut datagram(15, None, None, b"stale"), 3)
            .unwrap();

        let packet = framer.read_slot(3, 0).unwrap().unwrap();
        assert_eq!(packet.bytes(), b"fresh");
    }

    #[test]
    fn test_age_filter_survives_read() {
        let mut framer = per_client_framer();

        framer
            .deal_with_data(&mut datagram(20, None, None, b"first"), 3)
            .unwrap();
        framer.read_slot(3, 0).unwrap().unwrap();

        // Still older than the last observed age.
        framer
            .deal_with_data(&mut datagram(20, None, None, b"dup"), 3)
            .unwrap();
        assert!(framer.read_slot(3, 0).unwrap().is_none());

        framer
            .deal_with_data(&mut datagram(21, None, None, b"next"), 3)
            .unwrap();
        assert_eq!(framer.read_slot(3, 0).unwrap().unwrap().bytes(), b"next");
    }

    #[test]
    fn test_age_wraparound_resets() {
        let mut framer = per_client_framer();

        framer
            .deal_with_data(&mut datagram(1000, None, None, b"high"), 2)
            .unwrap();
        // Far below half the stored age: treated as a wrapped counter.
        framer
            .deal_with_data(&mut datagram(3, None, None, b"wrapped"), 2)
            .unwrap();

        assert_eq!(framer.read_slot(2, 0).unwrap().unwrap().bytes(), b"wrapped");
    }

    #[test]
    fn test_handshake_age_zero_is_ignored() {
        let mut framer = per_client_framer();
        framer
            .deal_with_data(&mut datagram(0, None, None, b"handshake"), 3)
            .unwrap();
        assert_eq!(framer.packet_amount(3, 0).unwrap(), 0);
    }

    #[test]
    fn test_client_id_extracted_when_unknown() {
        let mut framer = per_client_framer();

        framer
            .deal_with_data(&mut datagram(5, Some(4), None, b"routed"), 0)
            .unwrap();
        assert_eq!(framer.read_slot(4, 0).unwrap().unwrap().bytes(), b"routed");
    }

    #[test]
    fn test_out_of_range_client_is_an_error() {
        let mut framer = per_client_framer();
        let err = framer
            .deal_with_data(&mut datagram(5, Some(100), None, b"x"), 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn test_short_datagram_is_dropped() {
        let mut framer = per_client_framer();
        framer.deal_with_data(&mut [1u8, 2, 3][..], 3).unwrap();
        assert_eq!(framer.packet_amount(3, 0).unwrap(), 0);
    }

    #[test]
    fn test_per_operation_slots_are_independent() {
        let mut framer = UdpFramer::new(
            UdpMode::PerClientPerOp,
            512,
            4,
            3,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            None,
            1,
        );

        framer
            .deal_with_data(&mut datagram(10, None, Some(0), b"op0"), 2)
            .unwrap();
        framer
            .deal_with_data(&mut datagram(11, None, Some(2), b"op2"), 2)
            .unwrap();

        assert_eq!(framer.read_slot(2, 0).unwrap().unwrap().bytes(), b"op0");
        assert_eq!(framer.read_slot(2, 2).unwrap().unwrap().bytes(), b"op2");
        assert!(framer.read_slot(2, 1).unwrap().is_none());
    }

    #[test]
    fn test_catch_all_preserves_arrival_order() {
        let mut framer = UdpFramer::new(
            UdpMode::CatchAll,
            512,
            0,
            1,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            None,
            1,
        );

        framer.deal_with_data(&mut b"first".to_vec(), 0).unwrap();
        framer.deal_with_data(&mut b"second".to_vec(), 0).unwrap();

        assert_eq!(framer.get_packet().unwrap().bytes(), b"first");
        assert_eq!(framer.get_packet().unwrap().bytes(), b"second");
        assert!(framer.get_packet().is_none());
    }

    #[test]
    fn test_catch_all_no_reorder_filters_old_ages() {
        let mut framer = UdpFramer::new(
            UdpMode::CatchAllNoReorder,
            512,
            0,
            1,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            None,
            1,
        );

        let wire = |age: u64, payload: &[u8]| {
            build_datagram(UdpMode::CatchAllNoReorder, age, None, None, payload)
        };

        framer.deal_with_data(&mut wire(5, b"a"), 0).unwrap();
        framer.deal_with_data(&mut wire(4, b"late"), 0).unwrap();
        framer.deal_with_data(&mut wire(6, b"b"), 0).unwrap();

        assert_eq!(framer.get_packet().unwrap().bytes(), b"a");
        assert_eq!(framer.get_packet().unwrap().bytes(), b"b");
        assert!(framer.get_packet().is_none());
    }

    #[test]
    fn test_reset_client_clears_slot_and_age() {
        let mut framer = per_client_framer();

        framer
            .deal_with_data(&mut datagram(50, None, None, b"data"), 3)
            .unwrap();
        framer.reset_client(3);
        assert_eq!(framer.packet_amount(3, 0).unwrap(), 0);

        // A new connection starts its ages over.
        framer
            .deal_with_data(&mut datagram(1, None, None, b"fresh"), 3)
            .unwrap();
        assert_eq!(framer.read_slot(3, 0).unwrap().unwrap().bytes(), b"fresh");
    }

    #[test]
    fn test_callback_bypasses_slot() {
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback: RecvCallback = {
            let seen = seen.clone();
            Arc::new(move |packet: &mut Packet| {
                seen.lock().unwrap().push(packet.bytes().to_vec());
            })
        };

        let mut framer = UdpFramer::new(
            UdpMode::PerClient,
            512,
            8,
            1,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            Some(callback),
            1,
        );

        framer
            .deal_with_data(&mut datagram(9, None, None, b"cb"), 2)
            .unwrap();
        assert_eq!(framer.packet_amount(2, 0).unwrap(), 0);
        assert_eq!(&*seen.lock().unwrap(), &[b"cb".to_vec()]);
    }

    #[test]
    fn test_build_datagram_layouts() {
        assert_eq!(
            build_datagram(UdpMode::CatchAll, 99, None, None, b"xyz"),
            b"xyz".to_vec()
        );

        let wire = build_datagram(UdpMode::PerClientPerOp, 7, Some(3), Some(2), b"p");
        assert_eq!(wire.len(), 8 + 8 + 8 + 1);
        assert_eq!(&wire[..8], &7u64.to_le_bytes());
        assert_eq!(&wire[8..16], &3u64.to_le_bytes());
        assert_eq!(&wire[16..24], &2u64.to_le_bytes());
        assert_eq!(&wire[24..], b"p");
    }
}
