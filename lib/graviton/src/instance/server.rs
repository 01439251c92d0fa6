//! The server instance: listening socket, client slots, the
//! `client_joined` poll, UDP address resolution and the handshake.

use crate::framing::udp::{build_datagram, UdpMode};
use crate::instance::table::{ClientTable, AUTH_CODE_COUNT};
use crate::instance::ConnectionState;
use crate::packet::{MemoryRecycle, Packet, PREFIX_SIZE};
use crate::profile::Profile;
use crate::runtime::Runtime;
use crate::socket::{TcpConfig, TcpListening, TcpSocket, TcpStatus, UdpConfig, UdpSocket};
use crate::support::{raise, ErrorKind, NetResult, SendStatus};
use crate::sync::MemoryAccountant;
use lumen::{ClientId, InstanceId, OperationId};
use mio::net::TcpStream;
use slog::{o, Logger};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

/// State shared with the UDP resolver, which runs on completion workers.
struct ServerShared {
    table: ClientTable,
    udp: Option<Arc<UdpSocket>>,
    disconnects: Mutex<VecDeque<ClientId>>,
    log: Logger,
}

impl ServerShared {
    /// Routes one received datagram: a known sender address yields its
    /// client id; anything else is treated as a handshake attempt and
    /// consumed.
    fn resolve_datagram(&self, addr: SocketAddr, datagram: &mut [u8]) -> Option<ClientId> {
        match self.table.lookup(addr) {
            0 => {
                self.validate_handshake(addr, datagram);
                None
            }
            client => Some(client),
        }
    }

    /// Validates a UDP handshake packet. Every check failure drops the
    /// packet with no reply and no state change, so a prober learns
    /// nothing.
    fn validate_handshake(&self, addr: SocketAddr, datagram: &mut [u8]) {
        let mut view = Packet::new();
        unsafe { view.set_data_ptr(datagram.as_mut_ptr(), datagram.len(), datagram.len()) };

        let prefix = match view.get_age_stamp() {
            Ok(prefix) => prefix,
            Err(_) => return,
        };
        if prefix != 0 {
            return;
        }
        let claimed = match view.get_size() {
            Ok(claimed) => claimed,
            Err(_) => return,
        };
        let mut codes = [0u32; AUTH_CODE_COUNT];
        for code in codes.iter_mut() {
            *code = match view.get::<u32>() {
                Ok(code) => code,
                Err(_) => return,
            };
        }
        drop(view);

        // The address view lock always precedes the per-client lock.
        let _view = self.table.view_lock().enter_write();

        let client = match self.table.client(claimed) {
            Ok(client) => client,
            Err(_) => return,
        };

        {
            let mut state = client.lock();
            if state.status != ConnectionState::Connecting {
                return;
            }
            if state.auth_codes != codes {
                slog::debug!(self.log, "udp handshake failed authentication";
                             "claimed" => claimed, "peer" => %addr);
                return;
            }

            state.udp_addr = Some(addr);
            // State changes last, once the slot is fully set up.
            state.status = ConnectionState::ConnectedAc;
        }

        self.table.mark_dirty();
        slog::debug!(self.log, "udp association validated";
                     "client" => claimed, "peer" => %addr);
    }
}

/// A server accepting many clients over TCP with optional authenticated
/// UDP association.
pub struct Server {
    runtime: Arc<Runtime>,
    shared: Arc<ServerShared>,
    listening: TcpListening,
    profile: Profile,
    server_info: Vec<u8>,
    recycle_tcp: Arc<MemoryRecycle>,
    instance: InstanceId,
    log: Logger,
}

impl Server {
    /// Binds the listening and (when configured) UDP sockets and
    /// precomputes the server-info frame.
    pub fn open(runtime: &Arc<Runtime>, profile: Profile) -> NetResult<Server> {
        if profile.max_clients == 0 {
            return raise(ErrorKind::InvalidArgument, "opening a server with zero capacity");
        }

        let instance = runtime.next_instance_id();
        let log = runtime
            .logger()
            .new(o!("instance" => instance, "role" => "server"));

        let listening = TcpListening::bind(profile.local_addr_tcp, true, Some(&log))?;

        let recycle_tcp = Arc::new(build_recycle(profile.memory_recycle_tcp)?);

        let udp = if profile.udp_enabled() {
            let mode = profile.udp_mode.expect("udp_enabled implies a mode");
            Some(UdpSocket::bind(
                profile.local_addr_udp,
                UdpConfig {
                    mode,
                    recv_size: profile.recv_size_udp,
                    num_clients: profile.max_clients,
                    num_operations: profile.num_operations,
                    broadcast: false,
                    reusable: true,
                    send_timeout: profile.send_timeout(),
                    send_accountant: Arc::new(MemoryAccountant::from_option(
                        profile.send_mem_limit_udp,
                    )),
                    recv_accountant: Arc::new(MemoryAccountant::from_option(
                        profile.recv_mem_limit_udp,
                    )),
                    recycle: Arc::new(build_recycle(profile.memory_recycle_udp)?),
                    callback: profile.recv_func_udp.clone(),
                    instance,
                },
                runtime.iocore().clone(),
                Some(&log),
            )?)
        } else {
            None
        };

        // The server-info payload is fixed for the life of the instance.
        let mut info = Packet::new();
        info.add_size(profile.max_clients)?;
        if let Some(udp_socket) = &udp {
            let mode = udp_socket.mode();
            let operations = match mode {
                UdpMode::PerClientPerOp => profile.num_operations.max(1),
                _ => 1,
            };
            info.add_size(operations)?;
            info.add::<u8>(mode.mode_byte())?;
        }

        let shared = Arc::new(ServerShared {
            table: ClientTable::new(profile.max_clients),
            udp: udp.clone(),
            disconnects: Mutex::new(VecDeque::new()),
            log: log.clone(),
        });

        if let Some(udp_socket) = &udp {
            let weak: Weak<ServerShared> = Arc::downgrade(&shared);
            udp_socket.set_resolver(Box::new(move |addr, datagram| {
                weak.upgrade()
                    .and_then(|shared| shared.resolve_datagram(addr, datagram))
            }));
        }

        slog::info!(log, "server open";
                    "tcp" => ?listening.local_addr().ok(),
                    "max_clients" => profile.max_clients,
                    "udp" => udp.is_some());

        Ok(Server {
            runtime: runtime.clone(),
            shared,
            listening,
            server_info: info.bytes().to_vec(),
            recycle_tcp,
            instance,
            profile,
            log,
        })
    }

    #[inline]
    pub fn max_clients(&self) -> usize {
        self.shared.table.max_clients()
    }

    pub fn local_addr_tcp(&self) -> NetResult<SocketAddr> {
        self.listening.local_addr()
    }

    pub fn local_addr_udp(&self) -> NetResult<SocketAddr> {
        match &self.shared.udp {
            Some(udp) => udp.local_addr(),
            None => raise(ErrorKind::NotInitialized, "reading the udp address of a tcp-only server"),
        }
    }

    /// Connected-client count.
    pub fn client_count(&self) -> usize {
        self.shared
            .table
            .clients()
            .filter(|client| client.status() == ConnectionState::Connected)
            .count()
    }

    pub fn client_state(&self, client: ClientId) -> NetResult<ConnectionState> {
        Ok(self.shared.table.client(client)?.status())
    }

    pub fn client_tcp_status(&self, client: ClientId) -> NetResult<TcpStatus> {
        match self.shared.table.client(client)?.tcp() {
            Some(tcp) => Ok(tcp.connection_status()),
            None => Ok(TcpStatus::NotConnected),
        }
    }

    pub fn client_udp_addr(&self, client: ClientId) -> NetResult<Option<SocketAddr>> {
        Ok(self.shared.table.client(client)?.udp_addr())
    }

    /// Advances every slot's connection state machine, accepts at most one
    /// pending TCP connection and returns the id of a client that finished
    /// connecting during this call. Call continuously.
    pub fn client_joined(&self) -> NetResult<Option<ClientId>> {
        let result = self.client_joined_inner();
        self.runtime.errors().report(result, None)
    }

    fn client_joined_inner(&self) -> NetResult<Option<ClientId>> {
        let mut newly = None;
        let mut unused = 0;

        for client in self.shared.table.clients() {
            let id = client.id();
            match client.status() {
                ConnectionState::NotConnected => {
                    if unused == 0 {
                        unused = id;
                    }
                }

                ConnectionState::Connected => {
                    if let Some(tcp) = client.tcp() {
                        let drained = self.profile.graceful_disconnect_enabled
                            && tcp.connection_status() == TcpStatus::NotConnected;
                        if drained || tcp.close_requested().is_some() {
                            self.disconnect_client(id);
                        }
                    }
                }

                ConnectionState::Disconnecting => self.disconnect_client(id),

                ConnectionState::ConnectedAc => {
                    if newly.is_none() {
                        if self.confirm_client(id) {
                            newly = Some(id);
                        } else {
                            self.disconnect_client(id);
                        }
                    }
                }

                ConnectionState::Connecting => {
                    let timed_out =
                        client.handshake_elapsed() > self.profile.connection_timeout();
                    let errored = client
                        .tcp()
                        .map_or(true, |tcp| tcp.close_requested().is_some());
                    if timed_out || errored {
                        slog::debug!(self.log, "handshake abandoned"; "client" => id,
                                     "timed_out" => timed_out);
                        self.disconnect_client(id);
                    }
                }
            }
        }

        // Accept one pending connection into the free slot, or reject when
        // the server is full.
        if unused == 0 {
            self.listening.reject_pending()?;
        } else if let Some((stream, peer)) = self.listening.accept()? {
            if let Err(error) = self.load_client(unused, stream, peer) {
                slog::debug!(self.log, "loading accepted client failed";
                             "client" => unused, "error" => %error);
                self.disconnect_client(unused);
            }
        }

        Ok(newly)
    }

    /// Sends the zero-payload confirmation and promotes the slot. The send
    /// must block: the state change is only valid once the frame is on the
    /// wire.
    fn confirm_client(&self, id: ClientId) -> bool {
        let client = match self.shared.table.client(id) {
            Ok(client) => client,
            Err(_) => return false,
        };

        if self.profile.udp_enabled() {
            let confirmed = match client.tcp() {
                Some(tcp) => matches!(tcp.send(&[], true), Ok(SendStatus::Completed)),
                None => false,
            };
            if !confirmed {
                return false;
            }
        }

        let mut state = client.lock();
        state.status = ConnectionState::Connected;
        state.was_fully_connected = true;
        drop(state);

        slog::debug!(self.log, "client fully connected"; "client" => id);
        true
    }

    /// Stands up the accepted stream in slot `id` and sends the handshake
    /// frame.
    fn load_client(&self, id: ClientId, stream: TcpStream, peer: SocketAddr) -> NetResult<()> {
        let config = TcpConfig {
            framing: self.profile.tcp_framing()?,
            recv_size: self.profile.recv_size_tcp,
            auto_resize: self.profile.auto_resize_tcp,
            graceful_disconnect: self.profile.graceful_disconnect_enabled,
            nagle: self.profile.nagle_enabled,
            reusable: true,
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

        let socket = TcpSocket::open(stream, config, self.runtime.iocore().clone(), Some(&self.log))?;
        socket.set_client_from(id);

        let mut codes = [0u32; AUTH_CODE_COUNT];
        for code in codes.iter_mut() {
            *code = rand::random();
        }

        {
            let client = self.shared.table.client(id)?;
            let mut state = client.lock();
            state.tcp = Some(socket.clone());
            state.udp_addr = None;
            state.auth_codes = codes;
            state.started = Instant::now();
            state.was_fully_connected = false;
            state.status = if self.profile.handshake_enabled && self.profile.udp_enabled() {
                ConnectionState::Connecting
            } else {
                // Nothing further to wait for; the next poll confirms.
                ConnectionState::ConnectedAc
            };
        }

        slog::debug!(self.log, "client accepted"; "client" => id, "peer" => %peer);

        if self.profile.handshake_enabled {
            let mut frame = Packet::with_capacity(
                self.server_info.len() + PREFIX_SIZE + AUTH_CODE_COUNT * 4,
            );
            frame.add_bytes(&self.server_info, false)?;
            frame.add_size(id)?;
            if self.profile.udp_enabled() {
                for code in &codes {
                    frame.add::<u32>(*code)?;
                }
            }

            let status = socket.send_packet(&frame, false)?;
            if status.has_failed() {
                return raise(ErrorKind::Protocol, "sending the handshake frame");
            }
        }

        Ok(())
    }

    /// Tears a slot down: clears the UDP association, closes TCP, resets
    /// the UDP slot store and records the disconnect notification.
    fn disconnect_client(&self, id: ClientId) {
        let shared = &self.shared;
        let _view = shared.table.view_lock().enter_write();

        let client = match shared.table.client(id) {
            Ok(client) => client,
            Err(_) => return,
        };

        let (tcp, notify) = {
            let mut state = client.lock();
            if state.status == ConnectionState::NotConnected {
                return;
            }
            let tcp = state.tcp.take();
            let notify = state.was_fully_connected;
            state.udp_addr = None;
            state.status = ConnectionState::NotConnected;
            state.was_fully_connected = false;
            (tcp, notify)
        };

        if let Some(tcp) = tcp {
            tcp.close();
        }
        if let Some(udp) = &shared.udp {
            udp.reset_client(id);
        }
        if notify {
            shared.disconnects.lock().unwrap().push_back(id);
        }
        shared.table.mark_dirty();

        slog::debug!(self.log, "client disconnected"; "client" => id, "notified" => notify);
    }

    /// Kicks a client.
    pub fn disconnect(&self, client: ClientId) {
        self.disconnect_client(client);
    }

    /// Oldest unread disconnect notification.
    pub fn get_disconnect(&self) -> Option<ClientId> {
        self.shared.disconnects.lock().unwrap().pop_front()
    }

    /// Begins a graceful disconnect towards `client`.
    pub fn shutdown_send(&self, client: ClientId) -> NetResult<()> {
        match self.shared.table.client(client)?.tcp() {
            Some(tcp) => {
                tcp.shutdown_send();
                Ok(())
            }
            None => raise(ErrorKind::InvalidState, "shutting down an unconnected client"),
        }
    }

    // ---- data path ------------------------------------------------------

    pub fn send_tcp(&self, client: ClientId, payload: &[u8], block: bool) -> NetResult<SendStatus> {
        let result = self.send_tcp_inner(client, payload, block);
        self.runtime.errors().report(result, SendStatus::Failed)
    }

    fn send_tcp_inner(
        &self,
        client: ClientId,
        payload: &[u8],
        block: bool,
    ) -> NetResult<SendStatus> {
        let tcp = match self.shared.table.client(client)?.tcp() {
            Some(tcp) => tcp,
            None => {
                return raise(ErrorKind::InvalidState, "sending to an unconnected client")
            }
        };

        match tcp.send(payload, block) {
            Ok(SendStatus::FailedKill) => {
                self.disconnect_client(client);
                Ok(SendStatus::FailedKill)
            }
            Ok(status) => Ok(status),
            Err(err) => {
                // A refused charge tears the offender down.
                if err.kind() == ErrorKind::MemoryLimitExceeded {
                    self.disconnect_client(client);
                }
                Err(err)
            }
        }
    }

    pub fn recv_tcp(&self, client: ClientId) -> NetResult<Option<Packet>> {
        let result = self.recv_tcp_inner(client);
        self.runtime.errors().report(result, None)
    }

    fn recv_tcp_inner(&self, client: ClientId) -> NetResult<Option<Packet>> {
        Ok(self
            .shared
            .table
            .client(client)?
            .tcp()
            .and_then(|tcp| tcp.recv()))
    }

    pub fn packet_amount_tcp(&self, client: ClientId) -> NetResult<usize> {
        Ok(self
            .shared
            .table
            .client(client)?
            .tcp()
            .map_or(0, |tcp| tcp.packet_amount()))
    }

    pub fn percent_complete_tcp(&self, client: ClientId) -> NetResult<f32> {
        Ok(self
            .shared
            .table
            .client(client)?
            .tcp()
            .map_or(0.0, |tcp| tcp.percent_complete()))
    }

    /// Sends a datagram to `client`, prepending the age, the client id and
    /// (per-operation mode) the operation id.
    pub fn send_udp(
        &self,
        client: ClientId,
        operation: OperationId,
        payload: &[u8],
        block: bool,
    ) -> NetResult<SendStatus> {
        let result = self.send_udp_inner(client, operation, payload, block);
        self.runtime.errors().report(result, SendStatus::Failed)
    }

    fn send_udp_inner(
        &self,
        client: ClientId,
        operation: OperationId,
        payload: &[u8],
        block: bool,
    ) -> NetResult<SendStatus> {
        let udp = match &self.shared.udp {
            Some(udp) => udp,
            None => return raise(ErrorKind::NotInitialized, "sending udp on a tcp-only server"),
        };
        let target = match self.shared.table.client(client)?.udp_addr() {
            Some(target) => target,
            None => {
                return raise(
                    ErrorKind::InvalidState,
                    "sending udp to a client with no validated address",
                )
            }
        };

        let mode = udp.mode();
        let operation = match mode {
            UdpMode::PerClientPerOp => {
                if operation >= self.profile.num_operations.max(1) {
                    return raise(ErrorKind::InvalidArgument, "sending on an unknown operation");
                }
                Some(operation)
            }
            _ => None,
        };

        let wire = build_datagram(mode, lumen::time::age_millis(), Some(client), operation, payload);

        match udp.send_to(wire, target, block) {
            Ok(status) => Ok(status),
            Err(err) => {
                // The UDP send accountant is global; the client that
                // overflowed it is the one torn down.
                if err.kind() == ErrorKind::MemoryLimitExceeded {
                    self.disconnect_client(client);
                }
                Err(err)
            }
        }
    }

    pub fn recv_udp(&self, client: ClientId, operation: OperationId) -> NetResult<Option<Packet>> {
        let result = self.recv_udp_inner(client, operation);
        self.runtime.errors().report(result, None)
    }

    fn recv_udp_inner(
        &self,
        client: ClientId,
        operation: OperationId,
    ) -> NetResult<Option<Packet>> {
        match &self.shared.udp {
            Some(udp) => udp.read_slot(client, operation),
            None => raise(ErrorKind::NotInitialized, "receiving udp on a tcp-only server"),
        }
    }

    /// Oldest queued datagram in the catch-all modes.
    pub fn recv_udp_any(&self) -> Option<Packet> {
        self.shared.udp.as_ref().and_then(|udp| udp.get_packet())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for id in 1..=self.shared.table.max_clients() {
            self.disconnect_client(id);
        }
        if let Some(udp) = &self.shared.udp {
            udp.close();
        }
        slog::info!(self.log, "server closed");
    }
}

fn build_recycle(config: (usize, usize)) -> NetResult<MemoryRecycle> {
    let accountant = Arc::new(MemoryAccountant::unbounded());
    match config {
        (0, _) | (_, 0) => Ok(MemoryRecycle::disabled(accountant)),
        (count, size) => MemoryRecycle::new(count, size, accountant),
    }
}
