//! The top-level runtime objects: Client, Server and Broadcast instances,
//! plus the server's per-client records and address-indexed lookup.

pub mod broadcast;
pub mod client;
pub mod server;
pub mod table;

pub use self::broadcast::Broadcast;
pub use self::client::Client;
pub use self::server::Server;
pub use self::table::{ClientTable, ServerClient};

/// Handshake-level connection state of a client slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    NotConnected,
    /// TCP accepted; waiting for the UDP leg of the handshake.
    Connecting,
    /// UDP validated; waiting for the confirmation send in `client_joined`.
    ConnectedAc,
    Connected,
    /// Marked for teardown; the next `client_joined` sweep disconnects it.
    Disconnecting,
}
