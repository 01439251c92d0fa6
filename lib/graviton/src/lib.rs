//! `graviton` is a cross-protocol networking runtime: reliable TCP and
//! datagram UDP messaging between a single server and many clients, with
//! pluggable framing, authenticated UDP association, graceful teardown,
//! memory-bounded queues and multi-threaded packet encryption.
//!
//! The receive path runs OS event → completion worker → socket → framer →
//! instance; the send path inverts it. Instances (`Server`, `Client`,
//! `Broadcast`) are constructed from a [`runtime::Runtime`] context and a
//! [`profile::Profile`].
//!
//! Lock order, outermost first, for anything touching server state:
//! address view → per-client state → per-socket send tracker → packet
//! cipher wait. Never acquire in any other order.

pub mod crypto;
pub mod framing;
pub mod instance;
pub mod iocore;
pub mod packet;
pub mod profile;
pub mod runtime;
pub mod socket;
pub mod support;
pub mod sync;
pub mod worker;

pub use crate::instance::{Broadcast, Client, ConnectionState, Server};
pub use crate::packet::Packet;
pub use crate::profile::Profile;
pub use crate::runtime::Runtime;
pub use crate::support::{Error, ErrorKind, NetResult, SendStatus};
pub use lumen::{ClientId, InstanceId, OperationId};
