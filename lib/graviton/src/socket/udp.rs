//! The UDP socket core. One socket serves a whole instance; received
//! datagrams are routed by an optional resolver (the server's address
//! lookup) and then through the mode's framer.

use crate::framing::udp::{UdpFramer, UdpMode};
use crate::framing::RecvCallback;
use crate::iocore::{IoCore, IoHandler};
use crate::packet::{MemoryRecycle, Packet};
use crate::socket::send::{SendTicket, SendTracker};
use crate::support::{Error, NetResult, SendStatus};
use crate::sync::MemoryAccountant;
use lumen::{ClientId, InstanceId, OperationId};
use slog::{o, Discard, Logger};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Resolves a datagram's sender to a client id. Returning `None` means the
/// datagram was consumed (a handshake attempt) or must be dropped.
pub type UdpResolver = Box<dyn Fn(SocketAddr, &mut [u8]) -> Option<ClientId> + Send + Sync>;

/// Everything needed to stand up one UDP socket core.
pub struct UdpConfig {
    pub mode: UdpMode,
    pub recv_size: usize,
    pub num_clients: usize,
    pub num_operations: usize,
    pub broadcast: bool,
    pub reusable: bool,
    pub send_timeout: Option<Duration>,
    pub send_accountant: Arc<MemoryAccountant>,
    pub recv_accountant: Arc<MemoryAccountant>,
    pub recycle: Arc<MemoryRecycle>,
    pub callback: Option<RecvCallback>,
    pub instance: InstanceId,
}

struct UdpState {
    closed: bool,
    close_requested: Option<Error>,
}

/// A bound UDP socket registered with the completion core.
pub struct UdpSocket {
    socket: mio::net::UdpSocket,
    iocore: Arc<IoCore>,
    token: Mutex<Option<usize>>,

    framer: Mutex<UdpFramer>,
    tracker: SendTracker,
    resolver: Mutex<Option<UdpResolver>>,

    state: Mutex<UdpState>,
    dealing: Mutex<()>,
    recv_buf: Mutex<Vec<u8>>,

    send_timeout: Option<Duration>,
    log: Logger,
}

impl UdpSocket {
    /// Binds `addr`, applies the option bits and registers with the
    /// completion core.
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        addr: SocketAddr,
        config: UdpConfig,
        iocore: Arc<IoCore>,
        log: L,
    ) -> NetResult<Arc<UdpSocket>> {
        let log = match log.into() {
            Some(log) => log.new(o!("socket" => "udp")),
            None => Logger::root(Discard, o!()),
        };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(config.reusable)?;
        if config.broadcast {
            socket.set_broadcast(true)?;
        }
        socket.bind(&addr.into())?;

        let socket: std::net::UdpSocket = socket.into();
        socket.set_nonblocking(true)?;
        let socket = mio::net::UdpSocket::from_socket(socket)?;

        let framer = UdpFramer::new(
            config.mode,
            config.recv_size,
            config.num_clients,
            config.num_operations,
            config.recycle,
            config.recv_accountant,
            config.callback,
            config.instance,
        );

        let core = Arc::new(UdpSocket {
            socket,
            iocore: iocore.clone(),
            token: Mutex::new(None),
            framer: Mutex::new(framer),
            tracker: SendTracker::new(config.send_accountant),
            resolver: Mutex::new(None),
            state: Mutex::new(UdpState {
                closed: false,
                close_requested: None,
            }),
            dealing: Mutex::new(()),
            recv_buf: Mutex::new(vec![0u8; config.recv_size]),
            send_timeout: config.send_timeout,
            log,
        });

        let handler: Arc<dyn IoHandler> = core.clone();
        let weak: Weak<dyn IoHandler> = Arc::downgrade(&handler);
        let token = iocore.register(&core.socket, weak)?;
        *core.token.lock().unwrap() = Some(token);

        slog::debug!(core.log, "udp socket bound";
                     "addr" => ?core.socket.local_addr().ok(),
                     "mode" => ?config.mode,
                     "token" => token);
        Ok(core)
    }

    #[inline]
    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    #[inline]
    pub fn mode(&self) -> UdpMode {
        self.framer.lock().unwrap().mode()
    }

    /// Installs the sender-address resolver (the server's address-table
    /// lookup plus handshake validation).
    pub fn set_resolver(&self, resolver: UdpResolver) {
        *self.resolver.lock().unwrap() = Some(resolver);
    }

    #[inline]
    pub fn send_accountant(&self) -> &Arc<MemoryAccountant> {
        self.tracker.accountant()
    }

    /// Sends one datagram. Asynchronous sends charge the send accountant;
    /// a refused charge propagates with nothing queued.
    pub fn send_to(&self, wire: Vec<u8>, target: SocketAddr, block: bool) -> NetResult<SendStatus> {
        let ticket = SendTicket::raw(wire).with_target(target);
        let completion = ticket.completion();

        let result = self.tracker.send(ticket, !block, &mut |buf, target| {
            self.datagram_sink(buf, target)
        });

        match result {
            Ok(SendStatus::InProgress) if block => match completion.wait(self.send_timeout) {
                Some(status) => Ok(status),
                None => Ok(SendStatus::Failed),
            },
            Ok(status) => Ok(status),
            Err(err) if err.kind() == crate::support::ErrorKind::MemoryLimitExceeded => Err(err),
            Err(err) => {
                slog::debug!(self.log, "udp send failed"; "error" => %err);
                Ok(SendStatus::Failed)
            }
        }
    }

    fn datagram_sink(&self, buf: &[u8], target: Option<SocketAddr>) -> io::Result<usize> {
        let target = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "datagram without target"))?;
        self.socket.send_to(buf, &target)
    }

    // ---- receive-side accessors ----------------------------------------

    /// Takes the stored packet for `(client, operation)` (per-client
    /// modes).
    pub fn read_slot(
        &self,
        client: ClientId,
        operation: OperationId,
    ) -> NetResult<Option<Packet>> {
        self.framer.lock().unwrap().read_slot(client, operation)
    }

    /// Takes the oldest queued packet (catch-all modes).
    pub fn get_packet(&self) -> Option<Packet> {
        self.framer.lock().unwrap().get_packet()
    }

    pub fn packet_amount(&self, client: ClientId, operation: OperationId) -> NetResult<usize> {
        self.framer.lock().unwrap().packet_amount(client, operation)
    }

    /// Clears a client's slots when its id is recycled.
    pub fn reset_client(&self, client: ClientId) {
        self.framer.lock().unwrap().reset_client(client)
    }

    pub fn close_requested(&self) -> Option<Error> {
        self.state.lock().unwrap().close_requested.clone()
    }

    /// Closes the socket: cancels kernel interest, waits for in-flight
    /// receive handling and fails queued sends.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        if let Some(token) = self.token.lock().unwrap().take() {
            self.iocore.deregister(&self.socket, token);
        }

        drop(self.dealing.lock().unwrap());
        self.tracker.abandon(SendStatus::Failed);

        slog::debug!(self.log, "udp socket closed");
    }
}

impl IoHandler for UdpSocket {
    fn readable(&self) -> NetResult<()> {
        let _dealing = self.dealing.lock().unwrap();
        if self.state.lock().unwrap().closed {
            return Ok(());
        }

        let mut buf = self.recv_buf.lock().unwrap();
        let mut failures = 0u32;

        loop {
            match self.socket.recv_from(&mut buf[..]) {
                Ok((count, addr)) => {
                    failures = 0;
                    let datagram = &mut buf[..count];

                    let hint = {
                        let resolver = self.resolver.lock().unwrap();
                        match &*resolver {
                            Some(resolver) => match resolver(addr, datagram) {
                                Some(client) => client,
                                None => continue,
                            },
                            None => 0,
                        }
                    };

                    // A bad datagram must never error a shared socket.
                    if let Err(error) =
                        self.framer.lock().unwrap().deal_with_data(datagram, hint)
                    {
                        slog::debug!(self.log, "dropping udp datagram";
                                     "peer" => %addr, "error" => %error);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Reset-style errors surface here when an earlier send
                    // hit an unreachable port. Tolerate a bounded burst.
                    failures += 1;
                    if failures > 8 {
                        return Err(err.into());
                    }
                }
            }
        }
    }

    fn writable(&self) -> NetResult<()> {
        if self.state.lock().unwrap().closed {
            return Ok(());
        }
        self.tracker
            .flush(&mut |buf, target| self.datagram_sink(buf, target))
    }

    fn on_error(&self, error: Error) {
        let mut state = self.state.lock().unwrap();
        if state.close_requested.is_none() {
            state.close_requested = Some(error);
        }
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
