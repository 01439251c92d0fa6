//! Instance profiles: plain configuration values a caller fills in and
//! hands to an instance constructor. Loadable from TOML.

use crate::framing::tcp::TcpFraming;
use crate::framing::udp::UdpMode;
use crate::framing::RecvCallback;
use crate::support::{raise, ErrorKind, NetResult};
use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// TCP framing selector.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum TcpModeOption {
    LengthPrefix,
    Postfix,
    Raw,
}

/// Configuration for one instance. `Default` gives a single-client,
/// TCP-only, length-prefix profile listening on OS-chosen ports.
#[derive(Clone, Serialize, Deserialize)]
pub struct Profile {
    /// TCP binding address; IP 0 or port 0 means "let the OS choose".
    pub local_addr_tcp: SocketAddr,
    /// UDP binding address.
    pub local_addr_udp: SocketAddr,

    /// Server capacity; client ids run `1..=max_clients`.
    pub max_clients: usize,

    /// When false the handshake is skipped entirely: no client id, no UDP.
    pub handshake_enabled: bool,
    /// When false TCP sockets hard-close and `shutdown_send` is a no-op.
    pub graceful_disconnect_enabled: bool,
    pub nagle_enabled: bool,

    pub tcp_mode: TcpModeOption,
    /// Terminator bytes; required with [`TcpModeOption::Postfix`].
    pub postfix: Option<Vec<u8>>,

    /// UDP routing mode; `None` disables UDP.
    pub udp_mode: Option<UdpMode>,
    /// Operations per client; meaningful with per-client-per-op only.
    pub num_operations: usize,

    /// Initial partial-packet buffer size.
    pub recv_size_tcp: usize,
    /// Datagram receive buffer size.
    pub recv_size_udp: usize,
    /// Whether the TCP framer may grow past `recv_size_tcp`.
    pub auto_resize_tcp: bool,

    /// Per-client caps; `None` is unbounded.
    pub send_mem_limit_tcp: Option<usize>,
    pub recv_mem_limit_tcp: Option<usize>,
    /// Global caps shared by all clients on the UDP socket.
    pub send_mem_limit_udp: Option<usize>,
    pub recv_mem_limit_udp: Option<usize>,

    /// Recycle pool (packet count, packet size); (0, 0) disables pooling.
    pub memory_recycle_tcp: (usize, usize),
    pub memory_recycle_udp: (usize, usize),

    /// Milliseconds a blocking send waits; 0 waits forever.
    pub send_timeout_ms: u64,
    /// Milliseconds the whole handshake may take from first contact.
    pub connection_timeout_ms: u64,

    /// Synchronous receive callbacks; packets bypass the receive queues.
    #[serde(skip)]
    pub recv_func_tcp: Option<RecvCallback>,
    #[serde(skip)]
    pub recv_func_udp: Option<RecvCallback>,
}

impl Default for Profile {
    fn default() -> Profile {
        Profile {
            local_addr_tcp: "0.0.0.0:0".parse().unwrap(),
            local_addr_udp: "0.0.0.0:0".parse().unwrap(),
            max_clients: 1,
            handshake_enabled: true,
            graceful_disconnect_enabled: true,
            nagle_enabled: true,
            tcp_mode: TcpModeOption::LengthPrefix,
            postfix: None,
            udp_mode: None,
            num_operations: 1,
            recv_size_tcp: 4096,
            recv_size_udp: 8192,
            auto_resize_tcp: true,
            send_mem_limit_tcp: None,
            recv_mem_limit_tcp: None,
            send_mem_limit_udp: None,
            recv_mem_limit_udp: None,
            memory_recycle_tcp: (0, 0),
            memory_recycle_udp: (0, 0),
            send_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
            recv_func_tcp: None,
            recv_func_udp: None,
        }
    }
}

impl Profile {
    /// Loads a profile from TOML text.
    pub fn from_toml_str(text: &str) -> NetResult<Profile> {
        serdeconv::from_toml_str(text)
            .or_else(|_| raise(ErrorKind::InvalidArgument, "parsing a profile from toml"))
    }

    /// Resolves the TCP framing, validating the postfix requirement.
    pub fn tcp_framing(&self) -> NetResult<TcpFraming> {
        match self.tcp_mode {
            TcpModeOption::LengthPrefix => Ok(TcpFraming::LengthPrefix),
            TcpModeOption::Raw => Ok(TcpFraming::Raw),
            TcpModeOption::Postfix => match &self.postfix {
                Some(postfix) if !postfix.is_empty() => {
                    Ok(TcpFraming::Postfix(postfix.clone()))
                }
                _ => raise(
                    ErrorKind::InvalidArgument,
                    "building a postfix tcp framing without postfix bytes",
                ),
            },
        }
    }

    #[inline]
    pub fn udp_enabled(&self) -> bool {
        self.handshake_enabled && self.udp_mode.is_some()
    }

    #[inline]
    pub fn send_timeout(&self) -> Option<Duration> {
        match self.send_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}
