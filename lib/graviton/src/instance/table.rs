//! Per-slot client records and the address-indexed lookup over them.
//!
//! The table offers two views of the same slots: the identity view (index
//! by client id) and the address view (slot ids ordered by UDP peer
//! address for binary search). The address view is guarded by the MRSW
//! lock, which is the outermost lock in the server's lock order; per-client
//! state locks nest inside it.

use crate::instance::ConnectionState;
use crate::socket::TcpSocket;
use crate::support::{raise, ErrorKind, NetResult};
use crate::sync::MrswLock;
use lumen::ClientId;
use std::cell::UnsafeCell;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Authentication codes sent per connecting client.
pub const AUTH_CODE_COUNT: usize = 4;

pub(crate) struct SlotState {
    pub status: ConnectionState,
    pub tcp: Option<Arc<TcpSocket>>,
    pub udp_addr: Option<SocketAddr>,
    pub auth_codes: [u32; AUTH_CODE_COUNT],
    pub started: Instant,
    /// Gates disconnect notifications: a slot that never fully connected
    /// does not produce one.
    pub was_fully_connected: bool,
}

/// One server-side client slot.
pub struct ServerClient {
    id: ClientId,
    state: Mutex<SlotState>,
}

impl ServerClient {
    fn new(id: ClientId) -> ServerClient {
        ServerClient {
            id,
            state: Mutex::new(SlotState {
                status: ConnectionState::NotConnected,
                tcp: None,
                udp_addr: None,
                auth_codes: [0; AUTH_CODE_COUNT],
                started: Instant::now(),
                was_fully_connected: false,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<SlotState> {
        self.state.lock().unwrap()
    }

    pub fn status(&self) -> ConnectionState {
        self.lock().status
    }

    pub fn tcp(&self) -> Option<Arc<TcpSocket>> {
        self.lock().tcp.clone()
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.lock().udp_addr
    }

    /// Milliseconds the slot has been handshaking.
    pub fn handshake_elapsed(&self) -> std::time::Duration {
        self.lock().started.elapsed()
    }

    /// Compares the claimed codes against the ones generated for this slot.
    pub fn authenticate(&self, codes: &[u32]) -> bool {
        let state = self.lock();
        codes.len() == AUTH_CODE_COUNT && codes == state.auth_codes
    }

    fn udp_key(&self) -> Option<(u128, u16)> {
        self.lock().udp_addr.map(addr_key)
    }
}

/// Collapses an address into the (ip-as-integer, port) sort key.
fn addr_key(addr: SocketAddr) -> (u128, u16) {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => u32::from(ip) as u128,
        IpAddr::V6(ip) => u128::from(ip),
    };
    (ip, addr.port())
}

/// The identity and address views over the server's client slots.
pub struct ClientTable {
    slots: Vec<Arc<ServerClient>>,
    view: MrswLock,
    // Mutated only while holding the view write guard; read under either
    // guard. The UnsafeCell stands in for the aliasing the guards already
    // exclude.
    order: UnsafeCell<Vec<ClientId>>,
    dirty: AtomicBool,
}

unsafe impl Sync for ClientTable {}
unsafe impl Send for ClientTable {}

impl ClientTable {
    /// Slots for client ids `1..=max_clients`; slot 0 is a placeholder.
    pub fn new(max_clients: usize) -> ClientTable {
        ClientTable {
            slots: (0..=max_clients).map(ServerClient::new).map(Arc::new).collect(),
            view: MrswLock::new(),
            order: UnsafeCell::new((1..=max_clients).collect()),
            dirty: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn max_clients(&self) -> usize {
        self.slots.len() - 1
    }

    /// The identity view: the slot for `id`.
    pub fn client(&self, id: ClientId) -> NetResult<&Arc<ServerClient>> {
        if id == 0 || id >= self.slots.len() {
            return raise(ErrorKind::OutOfBounds, "looking up a client id");
        }
        Ok(&self.slots[id])
    }

    /// Iterates the identity view in id order.
    pub fn clients(&self) -> impl Iterator<Item = &Arc<ServerClient>> {
        self.slots.iter().skip(1)
    }

    /// The MRSW lock guarding the address view. It is the outermost lock of
    /// the server lock order; take it before any per-client lock.
    #[inline]
    pub fn view_lock(&self) -> &MrswLock {
        &self.view
    }

    /// Flags the address view for a lazy resort. Callers hold the view
    /// write guard (every mutation site already does).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    #[allow(clippy::mut_from_ref)]
    fn order_mut(&self) -> &mut Vec<ClientId> {
        unsafe { &mut *self.order.get() }
    }

    fn order(&self) -> &Vec<ClientId> {
        unsafe { &*self.order.get() }
    }

    /// Looks up the client whose UDP peer address is `addr`; 0 on miss.
    /// Performs the deferred resort first when the view is dirty.
    pub fn lookup(&self, addr: SocketAddr) -> ClientId {
        loop {
            if self.dirty.load(Ordering::Acquire) {
                let _guard = self.view.enter_write();
                if self.dirty.load(Ordering::Acquire) {
                    self.resort();
                    self.dirty.store(false, Ordering::Release);
                }
                return self.search(addr);
            }

            let _guard = self.view.enter_read();
            if self.dirty.load(Ordering::Acquire) {
                // A writer dirtied the view while we were acquiring; retry
                // on the write path.
                continue;
            }
            return self.search(addr);
        }
    }

    /// Stable sort of the address view by (ip, port), absent addresses
    /// first. Requires the view write guard.
    fn resort(&self) {
        let mut keyed: Vec<(Option<(u128, u16)>, ClientId)> = self
            .order()
            .iter()
            .map(|&id| (self.slots[id].udp_key(), id))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        *self.order_mut() = keyed.into_iter().map(|(_, id)| id).collect();
    }

    /// Binary search with the query address on the right-hand side of the
    /// comparator. Requires a view guard.
    fn search(&self, addr: SocketAddr) -> ClientId {
        let query = Some(addr_key(addr));
        let order = self.order();

        let index = order.partition_point(|&id| self.slots[id].udp_key() < query);
        match order.get(index) {
            Some(&id) if self.slots[id].udp_key() == query => id,
            _ => 0,
        }
    }
}
