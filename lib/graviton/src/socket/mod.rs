//! Protocol-agnostic socket plumbing: option application, send tracking and
//! the TCP/UDP/listening socket cores.

pub mod listen;
pub mod send;
pub mod tcp;
pub mod udp;

pub use self::listen::TcpListening;
pub use self::send::{SendTicket, SendTracker, TicketCompletion};
pub use self::tcp::{TcpConfig, TcpSocket, TcpStatus};
pub use self::udp::{UdpConfig, UdpSocket};

use socket2::SockRef;
use std::io;
use std::time::Duration;

/// Applies the option bits to a connected TCP stream. Options are applied
/// explicitly to every socket, including ones minted by `accept`; nothing
/// is inherited from the listener.
pub(crate) fn apply_stream_options(
    stream: &mio::net::TcpStream,
    nagle: bool,
    graceful_disconnect: bool,
    reusable: bool,
) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_reuse_address(reusable)?;
    socket.set_nodelay(!nagle)?;

    // Hard close: discard untransmitted data on close instead of lingering.
    if !graceful_disconnect {
        socket.set_linger(Some(Duration::from_secs(0)))?;
    }
    Ok(())
}
