//! The client instance: TCP connect, the two-legged handshake and the
//! post-connect data paths.

use crate::framing::udp::{build_datagram, UdpMode};
use crate::instance::table::AUTH_CODE_COUNT;
use crate::instance::ConnectionState;
use crate::packet::{MemoryRecycle, Packet};
use crate::profile::Profile;
use crate::runtime::Runtime;
use crate::socket::{TcpConfig, TcpSocket, TcpStatus, UdpConfig, UdpSocket};
use crate::support::{raise, Error, ErrorKind, NetResult, SendStatus};
use crate::sync::MemoryAccountant;
use lumen::{ClientId, InstanceId, OperationId};
use slog::{o, Logger};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How often the UDP handshake packet is re-sent while waiting for the
/// server's confirmation.
const HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_millis(25);
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Default)]
struct HandshakeInfo {
    client_id: ClientId,
    max_clients: usize,
    num_operations: usize,
    udp_mode: Option<UdpMode>,
    server_udp: Option<SocketAddr>,
}

/// A client of one server.
pub struct Client {
    runtime: Arc<Runtime>,
    instance: InstanceId,
    profile: Profile,

    tcp: Mutex<Option<Arc<TcpSocket>>>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    status: Mutex<ConnectionState>,
    info: Mutex<HandshakeInfo>,

    recycle_tcp: Arc<MemoryRecycle>,
    log: Logger,
}

impl Client {
    /// Builds an idle client; nothing connects until
    /// [`Client::connect`].
    pub fn open(runtime: &Arc<Runtime>, profile: Profile) -> NetResult<Client> {
        let instance = runtime.next_instance_id();
        let log = runtime
            .logger()
            .new(o!("instance" => instance, "role" => "client"));

        let recycle_tcp = match profile.memory_recycle_tcp {
            (0, _) | (_, 0) => MemoryRecycle::disabled(Arc::new(MemoryAccountant::unbounded())),
            (count, size) => {
                MemoryRecycle::new(count, size, Arc::new(MemoryAccountant::unbounded()))?
            }
        };

        Ok(Client {
            runtime: runtime.clone(),
            instance,
            profile,
            tcp: Mutex::new(None),
            udp: Mutex::new(None),
            status: Mutex::new(ConnectionState::NotConnected),
            info: Mutex::new(HandshakeInfo::default()),
            recycle_tcp: Arc::new(recycle_tcp),
            log,
        })
    }

    /// Connects to a server, running the whole handshake within the
    /// profile's connection timeout. `server_udp` is required when the
    /// profile enables a UDP mode.
    pub fn connect(
        &self,
        server_tcp: SocketAddr,
        server_udp: Option<SocketAddr>,
    ) -> NetResult<()> {
        {
            let mut status = self.status.lock().unwrap();
            if *status != ConnectionState::NotConnected {
                return self.runtime.errors().report(
                    raise(ErrorKind::InvalidState, "connecting an instance that is not idle"),
                    (),
                );
            }
            *status = ConnectionState::Connecting;
        }

        let result = self.connect_inner(server_tcp, server_udp);
        match &result {
            Ok(()) => {
                *self.status.lock().unwrap() = ConnectionState::Connected;
                slog::info!(self.log, "connected";
                            "server" => %server_tcp,
                            "client_id" => self.info.lock().unwrap().client_id);
            }
            Err(error) => {
                slog::debug!(self.log, "connect failed"; "error" => %error);
                self.disconnect();
            }
        }
        self.runtime.errors().report(result, ())
    }

    fn connect_inner(
        &self,
        server_tcp: SocketAddr,
        server_udp: Option<SocketAddr>,
    ) -> NetResult<()> {
        // The server-info frame layout depends on whether UDP is in play;
        // a half-configured call would desynchronize the parse.
        if self.profile.udp_enabled() != server_udp.is_some() {
            return raise(
                ErrorKind::InvalidArgument,
                "matching the udp profile against the server udp address",
            );
        }

        let deadline = Instant::now() + self.profile.connection_timeout();

        let stream =
            std::net::TcpStream::connect_timeout(&server_tcp, self.profile.connection_timeout())?;
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_stream(stream)?;

        let config = TcpConfig {
            framing: self.profile.tcp_framing()?,
            recv_size: self.profile.recv_size_tcp,
            auto_resize: self.profile.auto_resize_tcp,
            graceful_disconnect: self.profile.graceful_disconnect_enabled,
            nagle: self.profile.nagle_enabled,
            reusable: false,
            send_timeout: self.profile.send_timeout(),
            send_accountant: Arc::new(MemoryAccountant::from_option(
                self.profile.send_mem_limit_tcp,
            )),
            recv_accountant: Arc::new(MemoryAccountant::from_option(
                self.profile.recv_mem_limit_tcp,
            )),
            recycle: self.recycle_tcp.clone(),
            callback: self.profile.recv_func_tcp.clone(),
            instance: self.instance,
        };

        let tcp = TcpSocket::open(stream, config, self.runtime.iocore().clone(), Some(&self.log))?;
        *self.tcp.lock().unwrap() = Some(tcp.clone());

        if !self.profile.handshake_enabled {
            return Ok(());
        }

        // First frame: the server info.
        let mut first = self.wait_tcp_packet(&tcp, deadline)?;

        let udp_wanted = self.profile.udp_mode.is_some() && server_udp.is_some();

        let max_clients = first.get_size()?;
        let (num_operations, udp_mode) = if udp_wanted {
            let operations = first.get_size()?;
            let mode = UdpMode::from_mode_byte(first.get::<u8>()?)?;
            (operations, Some(mode))
        } else {
            (1, None)
        };
        let client_id = first.get_size()?;
        if client_id == 0 || client_id > max_clients {
            return raise(ErrorKind::Protocol, "validating the assigned client id");
        }
        let mut codes = [0u32; AUTH_CODE_COUNT];
        if udp_wanted {
            for code in codes.iter_mut() {
                *code = first.get::<u32>()?;
            }
        }

        {
            let mut info = self.info.lock().unwrap();
            info.client_id = client_id;
            info.max_clients = max_clients;
            info.num_operations = num_operations;
            info.udp_mode = udp_mode;
            info.server_udp = server_udp;
        }

        let mode = match udp_mode {
            Some(mode) => mode,
            None => return Ok(()),
        };

        let udp = UdpSocket::bind(
            self.profile.local_addr_udp,
            UdpConfig {
                mode,
                recv_size: self.profile.recv_size_udp,
                num_clients: max_clients,
                num_operations,
                broadcast: false,
                reusable: false,
                send_timeout: self.profile.send_timeout(),
                send_accountant: Arc::new(MemoryAccountant::from_option(
                    self.profile.send_mem_limit_udp,
                )),
                recv_accountant: Arc::new(MemoryAccountant::from_option(
                    self.profile.recv_mem_limit_udp,
                )),
                recycle: Arc::new(match self.profile.memory_recycle_udp {
                    (0, _) | (_, 0) => {
                        MemoryRecycle::disabled(Arc::new(MemoryAccountant::unbounded()))
                    }
                    (count, size) => {
                        MemoryRecycle::new(count, size, Arc::new(MemoryAccountant::unbounded()))?
                    }
                }),
                callback: self.profile.recv_func_udp.clone(),
                instance: self.instance,
            },
            self.runtime.iocore().clone(),
            Some(&self.log),
        )?;
        *self.udp.lock().unwrap() = Some(udp.clone());

        // Second leg: spam the authenticated UDP packet until the server's
        // zero-payload TCP confirmation arrives.
        let mut handshake = Packet::with_capacity(16 + AUTH_CODE_COUNT * 4);
        handshake.add_size(0)?;
        handshake.add_size(client_id)?;
        for code in &codes {
            handshake.add::<u32>(*code)?;
        }
        let wire = handshake.bytes().to_vec();
        let server_udp = server_udp.expect("udp_wanted implies an address");

        loop {
            if Instant::now() >= deadline {
                return raise(ErrorKind::Timeout, "completing the udp handshake");
            }

            let _ = udp.send_to(wire.clone(), server_udp, false);

            let resend_at = (Instant::now() + HANDSHAKE_RESEND_INTERVAL).min(deadline);
            loop {
                if let Some(packet) = tcp.recv() {
                    if packet.used() == 0 {
                        return Ok(());
                    }
                    // Data frames cannot precede the confirmation; drop.
                }
                if let Some(error) = tcp.close_requested() {
                    return Err(error);
                }
                if Instant::now() >= resend_at {
                    break;
                }
                std::thread::sleep(HANDSHAKE_POLL_INTERVAL);
            }
        }
    }

    fn wait_tcp_packet(&self, tcp: &Arc<TcpSocket>, deadline: Instant) -> NetResult<Packet> {
        loop {
            if let Some(packet) = tcp.recv() {
                return Ok(packet);
            }
            if let Some(error) = tcp.close_requested() {
                return Err(error);
            }
            if !matches!(
                tcp.connection_status(),
                TcpStatus::Connected | TcpStatus::NoSend
            ) {
                return Err(Error::new(
                    ErrorKind::Io(io::ErrorKind::ConnectionAborted),
                    "waiting for the server info frame",
                ));
            }
            if Instant::now() >= deadline {
                return raise(ErrorKind::Timeout, "waiting for the server info frame");
            }
            std::thread::sleep(HANDSHAKE_POLL_INTERVAL);
        }
    }

    /// Tears down both sockets and resets to idle.
    pub fn disconnect(&self) {
        if let Some(tcp) = self.tcp.lock().unwrap().take() {
            tcp.close();
        }
        if let Some(udp) = self.udp.lock().unwrap().take() {
            udp.close();
        }
        *self.status.lock().unwrap() = ConnectionState::NotConnected;
        *self.info.lock().unwrap() = HandshakeInfo::default();
    }

    /// Handshake-level state. A connected client whose transport died
    /// (error or fully drained teardown) is disconnected here.
    pub fn state(&self) -> ConnectionState {
        let status = *self.status.lock().unwrap();
        if status != ConnectionState::Connected {
            return status;
        }

        let dead = match self.tcp_socket() {
            Some(tcp) => {
                tcp.close_requested().is_some()
                    || tcp.connection_status() == TcpStatus::NotConnected
            }
            None => true,
        };
        if dead {
            self.disconnect();
            return ConnectionState::NotConnected;
        }
        status
    }

    /// Socket-level TCP teardown status.
    pub fn connection_status(&self) -> TcpStatus {
        match self.tcp_socket() {
            Some(tcp) => tcp.connection_status(),
            None => TcpStatus::NotConnected,
        }
    }

    fn tcp_socket(&self) -> Option<Arc<TcpSocket>> {
        self.tcp.lock().unwrap().clone()
    }

    fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp.lock().unwrap().clone()
    }

    // ---- handshake results ---------------------------------------------

    /// The id the server assigned, in `1..=max_clients`; 0 before the
    /// handshake completes.
    pub fn client_id(&self) -> ClientId {
        self.info.lock().unwrap().client_id
    }

    pub fn max_clients(&self) -> usize {
        self.info.lock().unwrap().max_clients
    }

    pub fn num_operations(&self) -> usize {
        self.info.lock().unwrap().num_operations
    }

    pub fn udp_mode(&self) -> Option<UdpMode> {
        self.info.lock().unwrap().udp_mode
    }

    // ---- data path ------------------------------------------------------

    pub fn send_tcp(&self, payload: &[u8], block: bool) -> NetResult<SendStatus> {
        let result = self.send_tcp_inner(payload, block);
        self.runtime.errors().report(result, SendStatus::Failed)
    }

    fn send_tcp_inner(&self, payload: &[u8], block: bool) -> NetResult<SendStatus> {
        match self.tcp_socket() {
            Some(tcp) => tcp.send(payload, block),
            None => raise(ErrorKind::InvalidState, "sending while not connected"),
        }
    }

    pub fn recv_tcp(&self) -> Option<Packet> {
        self.tcp_socket().and_then(|tcp| tcp.recv())
    }

    pub fn packet_amount_tcp(&self) -> usize {
        self.tcp_socket().map_or(0, |tcp| tcp.packet_amount())
    }

    pub fn percent_complete_tcp(&self) -> f32 {
        self.tcp_socket().map_or(0.0, |tcp| tcp.percent_complete())
    }

    /// Begins a graceful disconnect; queued inbound data stays readable.
    pub fn shutdown_send(&self) {
        if let Some(tcp) = self.tcp_socket() {
            tcp.shutdown_send();
        }
    }

    /// Sends a datagram to the server; the wire carries the age stamp and
    /// (per-operation mode) the operation id.
    pub fn send_udp(
        &self,
        operation: OperationId,
        payload: &[u8],
        block: bool,
    ) -> NetResult<SendStatus> {
        let result = self.send_udp_inner(operation, payload, block);
        self.runtime.errors().report(result, SendStatus::Failed)
    }

    fn send_udp_inner(
        &self,
        operation: OperationId,
        payload: &[u8],
        block: bool,
    ) -> NetResult<SendStatus> {
        let udp = match self.udp_socket() {
            Some(udp) => udp,
            None => return raise(ErrorKind::NotInitialized, "sending udp without an association"),
        };

        let mode = udp.mode();
        let operation = match mode {
            UdpMode::PerClientPerOp => {
                if operation >= self.num_operations().max(1) {
                    return raise(ErrorKind::InvalidArgument, "sending on an unknown operation");
                }
                Some(operation)
            }
            _ => None,
        };

        let target = self.server_udp_target()?;
        let wire = build_datagram(mode, lumen::time::age_millis(), None, operation, payload);
        udp.send_to(wire, target, block)
    }

    fn server_udp_target(&self) -> NetResult<SocketAddr> {
        // The server's UDP endpoint is the address the handshake used.
        match self.info.lock().unwrap().server_udp {
            Some(addr) => Ok(addr),
            None => raise(ErrorKind::NotInitialized, "resolving the server udp address"),
        }
    }

    /// Reads the freshest datagram stored for `(client_from, operation)`.
    pub fn recv_udp(
        &self,
        client_from: ClientId,
        operation: OperationId,
    ) -> NetResult<Option<Packet>> {
        match self.udp_socket() {
            Some(udp) => udp.read_slot(client_from, operation),
            None => raise(ErrorKind::NotInitialized, "receiving udp without an association"),
        }
    }

    /// Oldest queued datagram in the catch-all modes.
    pub fn recv_udp_any(&self) -> Option<Packet> {
        self.udp_socket().and_then(|udp| udp.get_packet())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
