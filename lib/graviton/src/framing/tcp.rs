//! TCP framing state machines. Incoming bytes accumulate in a
//! partial-packet store whose cursor tracks the parse position; complete
//! messages are carved into pooled packets and dispatched.

use crate::framing::{PacketQueue, RecvCallback};
use crate::packet::{MemoryRecycle, Packet, PREFIX_SIZE};
use crate::support::{raise, ErrorKind, NetResult};
use crate::sync::MemoryAccountant;
use byteorder::{ByteOrder, LittleEndian};
use lumen::{ClientId, InstanceId};
use std::sync::Arc;

/// How a TCP byte stream is split into messages.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TcpFraming {
    /// Every message is an 8-byte length followed by that many bytes.
    LengthPrefix,
    /// A user-chosen byte sequence terminates each message.
    Postfix(Vec<u8>),
    /// No framing; every received buffer is one message.
    Raw,
}

/// Per-connection TCP framer.
pub struct TcpFramer {
    mode: TcpFraming,
    partial: Packet,
    auto_resize: bool,
    search_from: usize,
    queue: PacketQueue,
    callback: Option<RecvCallback>,
    pool: Arc<MemoryRecycle>,
    instance: InstanceId,
    client_from: ClientId,
}

impl TcpFramer {
    pub fn new(
        mode: TcpFraming,
        recv_size: usize,
        auto_resize: bool,
        pool: Arc<MemoryRecycle>,
        recv_accountant: Arc<MemoryAccountant>,
        callback: Option<RecvCallback>,
        instance: InstanceId,
    ) -> TcpFramer {
        TcpFramer {
            mode,
            partial: Packet::with_capacity(recv_size),
            auto_resize,
            search_from: 0,
            queue: PacketQueue::new(recv_accountant),
            callback,
            pool,
            instance,
            client_from: 0,
        }
    }

    #[inline]
    pub fn mode(&self) -> &TcpFraming {
        &self.mode
    }

    /// Stamps the client id onto every packet this framer completes. Set by
    /// the server when a connection is loaded into a slot.
    #[inline]
    pub fn set_client_from(&mut self, client: ClientId) {
        self.client_from = client;
    }

    /// Feeds freshly received bytes through the state machine.
    pub fn deal_with_data(&mut self, bytes: &[u8]) -> NetResult<()> {
        if let TcpFraming::Raw = self.mode {
            let packet = self.carve_external(bytes)?;
            return self.dispatch(packet);
        }

        let new_size = self.partial.used() + bytes.len();
        if new_size > self.partial.capacity() {
            if !self.auto_resize {
                return raise(
                    ErrorKind::Protocol,
                    "receiving tcp data larger than the receive buffer",
                );
            }
            self.partial.change_memory_size(new_size)?;
        }
        self.partial.extend_from_slice(bytes)?;

        match self.mode {
            TcpFraming::LengthPrefix => self.parse_prefix(),
            TcpFraming::Postfix(_) => self.parse_postfix(),
            TcpFraming::Raw => unreachable!(),
        }
    }

    fn parse_prefix(&mut self) -> NetResult<()> {
        loop {
            if self.partial.remaining() < PREFIX_SIZE {
                break;
            }

            let header_at = self.partial.cursor();
            let payload_len = self.partial.get_size()?;
            let framed_len = payload_len + PREFIX_SIZE;

            if framed_len > self.partial.capacity() {
                if !self.auto_resize {
                    return raise(
                        ErrorKind::Protocol,
                        "expecting a tcp packet larger than the receive buffer",
                    );
                }
                self.partial.change_memory_size(framed_len)?;
            }

            if self.partial.used() - header_at < framed_len {
                // Wait for the rest of the payload.
                self.partial.set_cursor(header_at)?;
                break;
            }

            // Advance past the payload before dispatching, so a dispatch
            // failure leaves the parse position consistent.
            let payload_at = self.partial.cursor();
            self.partial.set_cursor(payload_at + payload_len)?;

            let packet = self.carve(payload_at, payload_len)?;
            self.dispatch(packet)?;
        }

        self.compact()
    }

    fn parse_postfix(&mut self) -> NetResult<()> {
        let postfix = match &self.mode {
            TcpFraming::Postfix(postfix) => postfix.clone(),
            _ => unreachable!(),
        };

        while let Some(found) =
            self.partial.find(self.search_from, self.partial.used(), &postfix)
        {
            let payload_at = self.partial.cursor();
            let payload_len = found - payload_at;

            self.partial.set_cursor(found + postfix.len())?;
            self.search_from = self.partial.cursor();

            let packet = self.carve(payload_at, payload_len)?;
            self.dispatch(packet)?;
        }

        self.compact()?;

        // Resume the next search where a split postfix could begin.
        self.search_from = self
            .partial
            .used()
            .saturating_sub(postfix.len() - 1);
        Ok(())
    }

    /// Copies `[start, start + len)` of the partial store into a pooled
    /// packet.
    fn carve(&mut self, start: usize, len: usize) -> NetResult<Packet> {
        let mut packet = self.pool.acquire(len);
        packet.extend_from_slice(&self.partial.bytes()[start..start + len])?;
        packet.set_client_from(self.client_from);
        packet.set_instance(self.instance);
        Ok(packet)
    }

    fn carve_external(&mut self, bytes: &[u8]) -> NetResult<Packet> {
        let mut packet = self.pool.acquire(bytes.len());
        packet.extend_from_slice(bytes)?;
        packet.set_client_from(self.client_from);
        packet.set_instance(self.instance);
        Ok(packet)
    }

    /// Erases everything before the parse cursor. Erasing is deferred until
    /// a whole receive has been parsed; dropping several messages at once
    /// beats shifting the tail per message.
    fn compact(&mut self) -> NetResult<()> {
        let parsed = self.partial.cursor();
        if parsed > 0 {
            self.partial.erase(0, parsed)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, mut packet: Packet) -> NetResult<()> {
        match &self.callback {
            Some(callback) => {
                callback(&mut packet);
                self.pool.release(packet);
                Ok(())
            }
            None => self.queue.push(packet),
        }
    }

    /// Completed packets waiting to be read.
    #[inline]
    pub fn packet_amount(&self) -> usize {
        self.queue.len()
    }

    /// Takes the oldest completed packet.
    #[inline]
    pub fn get_packet(&mut self) -> Option<Packet> {
        self.queue.pop()
    }

    /// Progress of the partially received packet, as a percentage of the
    /// expected payload. Only length-prefix framing can know this; the
    /// other modes report 0.
    pub fn percent_complete(&self) -> f32 {
        if let TcpFraming::LengthPrefix = self.mode {
            if self.partial.remaining() >= PREFIX_SIZE {
                let header_at = self.partial.cursor();
                let expected = LittleEndian::read_u64(
                    &self.partial.bytes()[header_at..header_at + PREFIX_SIZE],
                ) as usize;
                if expected == 0 {
                    return 100.0;
                }
                let have = self.partial.remaining() - PREFIX_SIZE;
                return (have as f32 / expected as f32 * 100.0).min(100.0);
            }
        }
        0.0
    }

    /// Drops partial and completed data; used when the connection resets.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.queue.clear();
        self.search_from = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn pool() -> Arc<MemoryRecycle> {
        Arc::new(MemoryRecycle::disabled(Arc::new(MemoryAccountant::unbounded())))
    }

    fn prefix_framer(recv_size: usize, auto_resize: bool) -> TcpFramer {
        TcpFramer::new(
            TcpFraming::LengthPrefix,
            recv_size,
            auto_resize,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            None,
            1,
        )
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut framed = (payload.len() as u64).to_le_bytes().to_vec();
        framed.extend_from_slice(payload);
        framed
    }

    fn drain(framer: &mut TcpFramer) -> Vec<Vec<u8>> {
        let mut output = Vec::new();
        while let Some(packet) = framer.get_packet() {
            output.push(packet.bytes().to_vec());
        }
        output
    }

    #[test]
    fn test_prefix_single_packet() {
        let mut framer = prefix_framer(64, false);
        framer.deal_with_data(&frame(b"Hello")).unwrap();
        assert_eq!(drain(&mut framer), vec![b"Hello".to_vec()]);
    }

    #[test]
    fn test_prefix_any_chunking_yields_same_packets() {
        let payloads: Vec<Vec<u8>> = vec![
            b"alpha".to_vec(),
            Vec::new(),
            (0u8..200).collect(),
            b"tail".to_vec(),
        ];
        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend_from_slice(&frame(payload));
        }

        for chunk_size in &[1usize, 2, 3, 7, 64, stream.len()] {
            let mut framer = prefix_framer(512, false);
            for chunk in stream.chunks(*chunk_size) {
                framer.deal_with_data(chunk).unwrap();
            }
            assert_eq!(drain(&mut framer), payloads, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_prefix_oversize_without_auto_resize_fails() {
        let mut framer = prefix_framer(16, false);
        let err = framer.deal_with_data(&frame(&[0u8; 100])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_prefix_oversize_header_without_auto_resize_fails() {
        let mut framer = prefix_framer(16, false);
        // Header alone fits, but announces a payload that cannot.
        let err = framer
            .deal_with_data(&(1000u64).to_le_bytes())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_prefix_auto_resize_grows() {
        let mut framer = prefix_framer(16, true);
        let payload = vec![7u8; 100];
        framer.deal_with_data(&frame(&payload)).unwrap();
        assert_eq!(drain(&mut framer), vec![payload]);
    }

    #[test]
    fn test_prefix_percent_complete() {
        let mut framer = prefix_framer(64, false);
        let framed = frame(&[1u8; 40]);

        framer.deal_with_data(&framed[..4]).unwrap();
        assert_eq!(framer.percent_complete(), 0.0);

        framer.deal_with_data(&framed[4..28]).unwrap();
        assert!((framer.percent_complete() - 50.0).abs() < 0.01);

        framer.deal_with_data(&framed[28..]).unwrap();
        assert_eq!(framer.packet_amount(), 1);
        assert_eq!(framer.percent_complete(), 0.0);
    }

    #[test]
    fn test_prefix_callback_receives_packets() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback: RecvCallback = {
            let seen = seen.clone();
            Arc::new(move |packet: &mut Packet| {
                seen.lock().unwrap().push(packet.bytes().to_vec());
            })
        };

        let mut framer = TcpFramer::new(
            TcpFraming::LengthPrefix,
            64,
            false,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            Some(callback),
            1,
        );

        framer.deal_with_data(&frame(b"one")).unwrap();
        framer.deal_with_data(&frame(b"two")).unwrap();

        assert_eq!(framer.packet_amount(), 0);
        assert_eq!(&*seen.lock().unwrap(), &[b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_prefix_queue_limit_fails() {
        let mut framer = TcpFramer::new(
            TcpFraming::LengthPrefix,
            64,
            false,
            pool(),
            Arc::new(MemoryAccountant::with_limit(8)),
            None,
            1,
        );

        framer.deal_with_data(&frame(&[0u8; 8])).unwrap();
        let err = framer.deal_with_data(&frame(&[0u8; 8])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryLimitExceeded);
    }

    fn postfix_framer(postfix: &[u8]) -> TcpFramer {
        TcpFramer::new(
            TcpFraming::Postfix(postfix.to_vec()),
            256,
            false,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            None,
            1,
        )
    }

    #[test]
    fn test_postfix_any_chunking_yields_same_packets() {
        let payloads: Vec<Vec<u8>> = vec![
            b"first line".to_vec(),
            Vec::new(),
            b"third".to_vec(),
        ];
        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend_from_slice(payload);
            stream.extend_from_slice(b"\r\n");
        }

        for chunk_size in &[1usize, 2, 5, stream.len()] {
            let mut framer = postfix_framer(b"\r\n");
            for chunk in stream.chunks(*chunk_size) {
                framer.deal_with_data(chunk).unwrap();
            }
            assert_eq!(drain(&mut framer), payloads, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_postfix_split_across_receives() {
        let mut framer = postfix_framer(b"END");
        framer.deal_with_data(b"payloadEN").unwrap();
        assert_eq!(framer.packet_amount(), 0);

        framer.deal_with_data(b"Dmore").unwrap();
        assert_eq!(drain(&mut framer), vec![b"payload".to_vec()]);
    }

    #[test]
    fn test_postfix_percent_is_zero() {
        let mut framer = postfix_framer(b"\n");
        framer.deal_with_data(b"partial").unwrap();
        assert_eq!(framer.percent_complete(), 0.0);
    }

    #[test]
    fn test_raw_passes_buffers_through() {
        let mut framer = TcpFramer::new(
            TcpFraming::Raw,
            64,
            false,
            pool(),
            Arc::new(MemoryAccountant::unbounded()),
            None,
            1,
        );

        framer.deal_with_data(b"chunk one").unwrap();
        framer.deal_with_data(b"chunk two").unwrap();
        assert_eq!(
            drain(&mut framer),
            vec![b"chunk one".to_vec(), b"chunk two".to_vec()]
        );
        assert_eq!(framer.percent_complete(), 0.0);
    }

    #[test]
    fn test_reset_discards_state() {
        let mut framer = prefix_framer(64, false);
        framer.deal_with_data(&frame(b"kept")).unwrap();
        framer.deal_with_data(&[5, 0, 0, 0]).unwrap();

        framer.reset();
        assert_eq!(framer.packet_amount(), 0);
        assert_eq!(framer.percent_complete(), 0.0);
    }

    #[test]
    fn test_completed_packets_carry_metadata() {
        let mut framer = prefix_framer(64, false);
        framer.set_client_from(4);
        framer.deal_with_data(&frame(b"x")).unwrap();

        let packet = framer.get_packet().unwrap();
        assert_eq!(packet.client_from(), 4);
        assert_eq!(packet.instance(), 1);
    }
}
