//! The broadcast instance: raw datagrams over a broadcast-enabled UDP
//! socket, no per-client structure and no handshake.

use crate::framing::udp::UdpMode;
use crate::packet::{MemoryRecycle, Packet};
use crate::profile::Profile;
use crate::runtime::Runtime;
use crate::socket::{UdpConfig, UdpSocket};
use crate::support::{NetResult, SendStatus};
use crate::sync::MemoryAccountant;
use lumen::InstanceId;
use slog::{o, Logger};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Broadcast {
    runtime: Arc<Runtime>,
    udp: Arc<UdpSocket>,
    instance: InstanceId,
    log: Logger,
}

impl Broadcast {
    /// Binds a broadcast-enabled UDP socket in catch-all mode. Received
    /// datagrams queue unclassified in arrival order.
    pub fn open(runtime: &Arc<Runtime>, profile: Profile) -> NetResult<Broadcast> {
        let instance = runtime.next_instance_id();
        let log = runtime
            .logger()
            .new(o!("instance" => instance, "role" => "broadcast"));

        let udp = UdpSocket::bind(
            profile.local_addr_udp,
            UdpConfig {
                mode: UdpMode::CatchAll,
                recv_size: profile.recv_size_udp,
                num_clients: 0,
                num_operations: 1,
                broadcast: true,
                reusable: true,
                send_timeout: profile.send_timeout(),
                send_accountant: Arc::new(MemoryAccountant::from_option(
                    profile.send_mem_limit_udp,
                )),
                recv_accountant: Arc::new(MemoryAccountant::from_option(
                    profile.recv_mem_limit_udp,
                )),
                recycle: Arc::new(match profile.memory_recycle_udp {
                    (0, _) | (_, 0) => {
                        MemoryRecycle::disabled(Arc::new(MemoryAccountant::unbounded()))
                    }
                    (count, size) => MemoryRecycle::new(
                        count,
                        size,
                        Arc::new(MemoryAccountant::unbounded()),
                    )?,
                }),
                callback: profile.recv_func_udp.clone(),
                instance,
            },
            runtime.iocore().clone(),
            Some(&log),
        )?;

        slog::info!(log, "broadcast open"; "addr" => ?udp.local_addr().ok());

        Ok(Broadcast {
            runtime: runtime.clone(),
            udp,
            instance,
            log,
        })
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.udp.local_addr()
    }

    /// Sends one raw datagram, typically to a subnet broadcast address.
    pub fn send(&self, payload: &[u8], target: SocketAddr, block: bool) -> NetResult<SendStatus> {
        let result = self.udp.send_to(payload.to_vec(), target, block);
        self.runtime.errors().report(result, SendStatus::Failed)
    }

    /// Oldest received datagram.
    pub fn recv(&self) -> Option<Packet> {
        self.udp.get_packet()
    }

    #[inline]
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }
}

impl Drop for Broadcast {
    fn drop(&mut self) {
        self.udp.close();
        slog::debug!(self.log, "broadcast closed");
    }
}
