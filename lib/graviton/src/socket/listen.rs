//! The listening socket. Accepting is driven by the server's
//! `client_joined` poll; the listener itself never registers with the
//! completion core.

use crate::support::{NetResult, raise, ErrorKind};
use mio::net::{TcpListener, TcpStream};
use slog::{o, Discard, Logger};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

pub struct TcpListening {
    listener: TcpListener,
    log: Logger,
}

impl TcpListening {
    /// Binds and starts listening. An IP of 0 or port of 0 lets the OS
    /// choose.
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        addr: SocketAddr,
        reusable: bool,
        log: L,
    ) -> NetResult<TcpListening> {
        let log = match log.into() {
            Some(log) => log.new(o!("socket" => "listen")),
            None => Logger::root(Discard, o!()),
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(reusable)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;

        let listener: std::net::TcpListener = socket.into();
        listener.set_nonblocking(true)?;

        let listener = TcpListener::from_std(listener)?;
        slog::debug!(log, "listening"; "addr" => ?listener.local_addr().ok());

        Ok(TcpListening { listener, log })
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one pending connection, if any. The caller decides
    /// accept-or-reject before asking; use [`TcpListening::reject_pending`]
    /// when the decision is reject.
    pub fn accept(&self) -> NetResult<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                slog::debug!(self.log, "accepted connection"; "peer" => %addr);
                Ok(Some((stream, addr)))
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Accepts and immediately drops one pending connection. Used when the
    /// server has no free client slot.
    pub fn reject_pending(&self) -> NetResult<bool> {
        match self.accept()? {
            Some((stream, addr)) => {
                slog::debug!(self.log, "rejecting connection, no free slot"; "peer" => %addr);
                drop(stream);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Parses `ip:port` text into a socket address.
pub fn parse_addr(text: &str) -> NetResult<SocketAddr> {
    text.parse()
        .or_else(|_| raise(ErrorKind::InvalidArgument, "parsing a socket address"))
}
