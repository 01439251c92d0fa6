//! The TCP socket core: receive draining into the framer, tracked sends,
//! and the graceful-disconnect state machine.

use crate::framing::tcp::{TcpFramer, TcpFraming};
use crate::framing::RecvCallback;
use crate::iocore::{IoCore, IoHandler};
use crate::packet::{MemoryRecycle, Packet};
use crate::socket::send::{SendTicket, SendTracker};
use crate::support::{raise, Error, ErrorKind, NetResult, SendStatus};
use crate::sync::{Event, MemoryAccountant};
use lumen::{ClientId, InstanceId};
use mio::net::TcpStream;
use slog::{o, Discard, Logger};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Socket-level connection state during graceful teardown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TcpStatus {
    /// Both directions open.
    Connected,
    /// The peer shut down its sending side; local sends still work.
    NoRecv,
    /// This side shut down sending; receives still work.
    NoSend,
    /// Both directions shut, undelivered data remains.
    NoSendRecv,
    /// Fully torn down and drained.
    NotConnected,
}

/// Everything needed to stand up one TCP socket core. The server clones one
/// of these per accepted client (the client template), swapping in fresh
/// per-client accountants.
#[derive(Clone)]
pub struct TcpConfig {
    pub framing: TcpFraming,
    pub recv_size: usize,
    pub auto_resize: bool,
    pub graceful_disconnect: bool,
    pub nagle: bool,
    pub reusable: bool,
    pub send_timeout: Option<Duration>,
    pub send_accountant: Arc<MemoryAccountant>,
    pub recv_accountant: Arc<MemoryAccountant>,
    pub recycle: Arc<MemoryRecycle>,
    pub callback: Option<RecvCallback>,
    pub instance: InstanceId,
}

struct LinkState {
    send_possible: bool,
    recv_possible: bool,
    dealing_with_data: bool,
    close_requested: Option<Error>,
    closed: bool,
}

/// A connected TCP socket registered with the completion core.
///
/// Never call [`TcpSocket::close`] from a completion worker; with a single
/// worker the close would wait on its own receive handling.
pub struct TcpSocket {
    stream: TcpStream,
    iocore: Arc<IoCore>,
    token: Mutex<Option<usize>>,

    framing: TcpFraming,
    framer: Mutex<TcpFramer>,
    tracker: SendTracker,

    state: Mutex<LinkState>,
    /// Held for the duration of every receive handler; close waits on it.
    dealing: Mutex<()>,
    /// Set once the peer's shutdown (or a receive error) is observed.
    recv_closed: Event,
    recv_buf: Mutex<Vec<u8>>,

    graceful: bool,
    send_timeout: Option<Duration>,
    log: Logger,
}

impl TcpSocket {
    /// Wraps a connected stream, applies the option bits and registers with
    /// the completion core.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(
        stream: TcpStream,
        config: TcpConfig,
        iocore: Arc<IoCore>,
        log: L,
    ) -> NetResult<Arc<TcpSocket>> {
        let log = match log.into() {
            Some(log) => log.new(o!("socket" => "tcp")),
            None => Logger::root(Discard, o!()),
        };

        crate::socket::apply_stream_options(
            &stream,
            config.nagle,
            config.graceful_disconnect,
            config.reusable,
        )?;

        let framer = TcpFramer::new(
            config.framing.clone(),
            config.recv_size,
            config.auto_resize,
            config.recycle,
            config.recv_accountant,
            config.callback,
            config.instance,
        );

        let socket = Arc::new(TcpSocket {
            stream,
            iocore: iocore.clone(),
            token: Mutex::new(None),
            framing: config.framing,
            framer: Mutex::new(framer),
            tracker: SendTracker::new(config.send_accountant),
            state: Mutex::new(LinkState {
                send_possible: true,
                recv_possible: true,
                dealing_with_data: false,
                close_requested: None,
                closed: false,
            }),
            dealing: Mutex::new(()),
            recv_closed: Event::manual(false),
            recv_buf: Mutex::new(vec![0u8; config.recv_size]),
            graceful: config.graceful_disconnect,
            send_timeout: config.send_timeout,
            log,
        });

        let handler: Arc<dyn IoHandler> = socket.clone();
        let weak: Weak<dyn IoHandler> = Arc::downgrade(&handler);
        let token = iocore.register(&socket.stream, weak)?;
        *socket.token.lock().unwrap() = Some(token);

        slog::debug!(socket.log, "tcp socket opened";
                     "peer" => ?socket.stream.peer_addr().ok(),
                     "token" => token);
        Ok(socket)
    }

    #[inline]
    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    #[inline]
    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Stamps the client id onto packets completed from now on.
    pub fn set_client_from(&self, client: ClientId) {
        self.framer.lock().unwrap().set_client_from(client);
    }

    // ---- send path ------------------------------------------------------

    /// Frames and sends `payload`. Blocking sends wait for completion up to
    /// the configured send timeout and are not charged against the send
    /// accountant; asynchronous sends are charged up front and a refused
    /// charge propagates with the ticket never queued.
    pub fn send(&self, payload: &[u8], block: bool) -> NetResult<SendStatus> {
        {
            let state = self.state.lock().unwrap();
            if state.closed || !state.send_possible {
                return raise(
                    ErrorKind::InvalidState,
                    "sending on a tcp socket that cannot send",
                );
            }
        }

        let ticket = match &self.framing {
            TcpFraming::LengthPrefix => SendTicket::prefix(
                (payload.len() as u64).to_le_bytes().to_vec(),
                payload.to_vec(),
            ),
            TcpFraming::Postfix(postfix) => {
                SendTicket::postfix(payload.to_vec(), postfix.clone())
            }
            TcpFraming::Raw => SendTicket::raw(payload.to_vec()),
        };
        let completion = ticket.completion();

        let result = self
            .tracker
            .send(ticket, !block, &mut |buf, _| (&self.stream).write(buf));

        match result {
            Ok(SendStatus::InProgress) if block => {
                match completion.wait(self.send_timeout) {
                    Some(status) => Ok(status),
                    None => Ok(SendStatus::Failed),
                }
            }
            Ok(status) => Ok(status),
            Err(err) if err.kind() == ErrorKind::MemoryLimitExceeded => Err(err),
            Err(err) => {
                slog::debug!(self.log, "tcp send failed"; "error" => %err);
                Ok(SendStatus::FailedKill)
            }
        }
    }

    /// Sends the used bytes of a packet.
    #[inline]
    pub fn send_packet(&self, packet: &Packet, block: bool) -> NetResult<SendStatus> {
        self.send(packet.bytes(), block)
    }

    #[inline]
    pub fn send_accountant(&self) -> &Arc<MemoryAccountant> {
        self.tracker.accountant()
    }

    #[inline]
    pub fn outstanding_sends(&self) -> usize {
        self.tracker.outstanding()
    }

    // ---- receive path ---------------------------------------------------

    /// Takes the oldest completed packet, if any.
    pub fn recv(&self) -> Option<Packet> {
        self.framer.lock().unwrap().get_packet()
    }

    pub fn packet_amount(&self) -> usize {
        self.framer.lock().unwrap().packet_amount()
    }

    pub fn percent_complete(&self) -> f32 {
        self.framer.lock().unwrap().percent_complete()
    }

    fn drain_stream(&self) -> NetResult<()> {
        let mut buf = self.recv_buf.lock().unwrap();

        loop {
            match (&self.stream).read(&mut buf[..]) {
                Ok(0) => {
                    self.state.lock().unwrap().recv_possible = false;
                    self.recv_closed.set();
                    slog::debug!(self.log, "peer shut down sending");
                    return Ok(());
                }
                Ok(count) => {
                    self.framer.lock().unwrap().deal_with_data(&buf[..count])?;
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(());
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.state.lock().unwrap().recv_possible = false;
                    self.recv_closed.set();
                    return Err(err.into());
                }
            }
        }
    }

    // ---- teardown -------------------------------------------------------

    /// Half-closes the sending direction. A no-op when graceful disconnect
    /// is disabled (the socket hard-closes instead).
    pub fn shutdown_send(&self) {
        if !self.graceful {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.closed || !state.send_possible {
                return;
            }
            state.send_possible = false;
        }

        let _ = self.stream.shutdown(Shutdown::Write);
        slog::debug!(self.log, "send direction shut down");
    }

    /// Derives the five-state connection status from the shutdown flags,
    /// in-progress receive handling and framer backlog.
    pub fn connection_status(&self) -> TcpStatus {
        let (closed, send_ok, recv_ok, dealing) = {
            let state = self.state.lock().unwrap();
            (
                state.closed,
                state.send_possible,
                state.recv_possible,
                state.dealing_with_data,
            )
        };

        if closed {
            return TcpStatus::NotConnected;
        }
        if !self.graceful {
            return TcpStatus::Connected;
        }

        match (send_ok, recv_ok) {
            (true, true) => TcpStatus::Connected,
            (true, false) => {
                if !dealing {
                    TcpStatus::NoRecv
                } else {
                    TcpStatus::Connected
                }
            }
            (false, true) => TcpStatus::NoSend,
            (false, false) => {
                let drained = self.framer.lock().unwrap().packet_amount() == 0;
                if !dealing && drained {
                    TcpStatus::NotConnected
                } else {
                    TcpStatus::NoSendRecv
                }
            }
        }
    }

    /// Error recorded by a completion worker, if any. The owning instance
    /// polls this and performs the disconnect.
    pub fn close_requested(&self) -> Option<Error> {
        self.state.lock().unwrap().close_requested.clone()
    }

    /// Waits for the peer-shutdown event.
    pub fn wait_recv_closed(&self, timeout: Option<Duration>) -> bool {
        self.recv_closed.wait(timeout)
    }

    /// Closes the socket: cancels kernel interest, waits for the in-flight
    /// receive handler, pushes out what the kernel will still take and
    /// fails the rest.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.send_possible = false;
        }

        if let Some(token) = self.token.lock().unwrap().take() {
            self.iocore.deregister(&self.stream, token);
        }
        let _ = self.stream.shutdown(Shutdown::Both);

        // Wait for a receive handler that is mid-flight.
        drop(self.dealing.lock().unwrap());

        if self.iocore.is_running() {
            let _ = self.tracker.flush(&mut |buf, _| (&self.stream).write(buf));
        }
        self.tracker.abandon(SendStatus::Failed);

        self.state.lock().unwrap().recv_possible = false;
        self.recv_closed.set();

        slog::debug!(self.log, "tcp socket closed");
    }
}

impl IoHandler for TcpSocket {
    fn readable(&self) -> NetResult<()> {
        let _dealing = self.dealing.lock().unwrap();
        if self.state.lock().unwrap().closed {
            return Ok(());
        }

        self.state.lock().unwrap().dealing_with_data = true;
        let result = self.drain_stream();
        self.state.lock().unwrap().dealing_with_data = false;
        result
    }

    fn writable(&self) -> NetResult<()> {
        if self.state.lock().unwrap().closed {
            return Ok(());
        }
        self.tracker.flush(&mut |buf, _| (&self.stream).write(buf))
    }

    fn on_error(&self, error: Error) {
        let mut state = self.state.lock().unwrap();
        if state.close_requested.is_none() {
            state.close_requested = Some(error);
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;
    use std::time::Instant;

    fn config() -> TcpConfig {
        TcpConfig {
            framing: TcpFraming::LengthPrefix,
            recv_size: 1024,
            auto_resize: true,
            graceful_disconnect: true,
            nagle: true,
            reusable: false,
            send_timeout: Some(Duration::from_secs(5)),
            send_accountant: Arc::new(MemoryAccountant::unbounded()),
            recv_accountant: Arc::new(MemoryAccountant::unbounded()),
            recycle: Arc::new(MemoryRecycle::disabled(Arc::new(
                MemoryAccountant::unbounded(),
            ))),
            callback: None,
            instance: 1,
        }
    }

    fn socket_pair(iocore: &Arc<IoCore>) -> (Arc<TcpSocket>, Arc<TcpSocket>) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();

        let client = TcpStream::from_stream(client).unwrap();
        let server = TcpStream::from_stream(server).unwrap();

        let a = TcpSocket::open(client, config(), iocore.clone(), None).unwrap();
        let b = TcpSocket::open(server, config(), iocore.clone(), None).unwrap();
        (a, b)
    }

    fn wait_packet(socket: &Arc<TcpSocket>) -> Packet {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(packet) = socket.recv() {
                return packet;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a packet");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_status(socket: &Arc<TcpSocket>, wanted: TcpStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if socket.connection_status() == wanted {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?}, at {:?}",
                wanted,
                socket.connection_status()
            );
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_framed_roundtrip() {
        let iocore = IoCore::start(2, None).unwrap();
        let (a, b) = socket_pair(&iocore);

        assert_eq!(a.send(b"Hello", true).unwrap(), SendStatus::Completed);
        assert_eq!(wait_packet(&b).bytes(), b"Hello");

        assert_eq!(b.send(b"world", true).unwrap(), SendStatus::Completed);
        assert_eq!(wait_packet(&a).bytes(), b"world");

        a.close();
        b.close();
    }

    #[test]
    fn test_shutdown_send_is_seen_as_no_recv() {
        let iocore = IoCore::start(1, None).unwrap();
        let (a, b) = socket_pair(&iocore);

        assert_eq!(a.connection_status(), TcpStatus::Connected);

        a.shutdown_send();
        assert_eq!(a.connection_status(), TcpStatus::NoSend);

        wait_status(&b, TcpStatus::NoRecv);
        assert!(b.wait_recv_closed(Some(Duration::from_secs(1))));

        a.close();
        b.close();
        assert_eq!(a.connection_status(), TcpStatus::NotConnected);
    }

    #[test]
    fn test_data_before_shutdown_is_delivered() {
        let iocore = IoCore::start(2, None).unwrap();
        let (a, b) = socket_pair(&iocore);

        for n in 0u8..5 {
            assert_eq!(a.send(&[n; 16], true).unwrap(), SendStatus::Completed);
        }
        a.shutdown_send();

        for n in 0u8..5 {
            assert_eq!(wait_packet(&b).bytes(), &[n; 16][..]);
        }
        wait_status(&b, TcpStatus::NoRecv);

        a.close();
        b.close();
    }

    #[test]
    fn test_send_on_shut_socket_is_invalid() {
        let iocore = IoCore::start(1, None).unwrap();
        let (a, b) = socket_pair(&iocore);

        a.shutdown_send();
        let err = a.send(b"late", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        a.close();
        b.close();
    }

    #[test]
    fn test_async_send_charges_accountant() {
        let iocore = IoCore::start(1, None).unwrap();

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (_held, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();

        let mut cfg = config();
        cfg.send_accountant = Arc::new(MemoryAccountant::with_limit(64));
        let socket = TcpSocket::open(
            TcpStream::from_stream(client).unwrap(),
            cfg,
            iocore.clone(),
            None,
        )
        .unwrap();

        // Saturate the kernel buffer until sends start queueing, then keep
        // going until the accountant refuses.
        let payload = vec![0u8; 16 * 1024];
        let mut refused = false;
        for _ in 0..4096 {
            match socket.send(&payload, false) {
                Ok(_) => (),
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::MemoryLimitExceeded);
                    refused = true;
                    break;
                }
            }
        }
        assert!(refused, "accountant never refused a charge");

        socket.close();
    }
}
