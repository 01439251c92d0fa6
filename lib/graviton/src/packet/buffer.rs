use crate::crypto::{self, CipherHandle, CipherKey};
use crate::support::{raise, ErrorKind, NetResult};
use byteorder::{ByteOrder, LittleEndian};
use lumen::{ClientId, InstanceId, OperationId};
use std::fmt;
use std::sync::Arc;

/// Wire width of a size or age prefix. Always 8 bytes regardless of the
/// native word size, so 32-bit and 64-bit builds interoperate.
pub const PREFIX_SIZE: usize = 8;

/// Storage behind a packet. Owned storage is allocated exactly: the slice
/// length is the capacity. Borrowed storage points at memory owned
/// elsewhere; the packet must never reallocate or free it.
enum Storage {
    Owned(Box<[u8]>),
    Borrowed { data: *mut u8, capacity: usize },
}

// Owned storage is trivially Send. A borrowed packet must never leave the
// scope that owns the pointee; the receive paths that install borrowed
// storage parse and drop the packet on one thread.
unsafe impl Send for Storage {}

impl Storage {
    #[inline]
    fn capacity(&self) -> usize {
        match self {
            Storage::Owned(data) => data.len(),
            Storage::Borrowed { capacity, .. } => *capacity,
        }
    }

    #[inline]
    fn is_borrowed(&self) -> bool {
        match self {
            Storage::Owned(_) => false,
            Storage::Borrowed { .. } => true,
        }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(data) => data,
            Storage::Borrowed { data, capacity } => unsafe {
                std::slice::from_raw_parts(*data, *capacity)
            },
        }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(data) => data,
            Storage::Borrowed { data, capacity } => unsafe {
                std::slice::from_raw_parts_mut(*data, *capacity)
            },
        }
    }
}

/// Efficiently stores and manipulates a block of data.
///
/// A cursor marks where `add` operations write and `get` operations read;
/// both advance it. Two sizes track the buffer: the capacity (allocated
/// bytes) and the used size (bytes logically written). Emptying a packet is
/// just `used = 0`; no bytes move. The invariant `cursor <= used <=
/// capacity` holds after every operation.
///
/// Integer prefixes written with [`Packet::add_size`] and
/// [`Packet::add_age`] always occupy exactly [`PREFIX_SIZE`] wire bytes.
pub struct Packet {
    storage: Storage,
    used: usize,
    cursor: usize,

    client_from: ClientId,
    operation: OperationId,
    instance: InstanceId,
    age: u64,

    cipher: Option<CipherHandle>,
}

impl Packet {
    #[inline]
    pub fn new() -> Packet {
        Packet::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Packet {
        Packet {
            storage: Storage::Owned(vec![0u8; capacity].into_boxed_slice()),
            used: 0,
            cursor: 0,
            client_from: 0,
            operation: 0,
            instance: 0,
            age: 0,
            cipher: None,
        }
    }

    /// A packet preloaded with `bytes`, cursor at 0.
    pub fn from_bytes(bytes: &[u8]) -> Packet {
        let mut packet = Packet::with_capacity(bytes.len());
        packet.storage.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        packet.used = bytes.len();
        packet
    }

    /// Blocks until any outstanding cipher operation on this packet has
    /// finished. Every operation that touches the data calls this first.
    fn sync_cipher(&self) {
        if let Some(handle) = &self.cipher {
            handle.wait(None);
        }
    }

    // ---- sizes and cursor ----------------------------------------------

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn is_borrowed(&self) -> bool {
        self.storage.is_borrowed()
    }

    /// Bytes between the cursor and the used size.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.used - self.cursor
    }

    /// The used portion of the buffer.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.sync_cipher();
        &self.storage.as_slice()[..self.used]
    }

    pub fn set_used(&mut self, used: usize) -> NetResult<()> {
        self.sync_cipher();
        if used > self.capacity() {
            return raise(ErrorKind::OutOfBounds, "setting the used size of a packet");
        }
        self.used = used;
        self.cursor = self.cursor.min(used);
        Ok(())
    }

    pub fn set_cursor(&mut self, cursor: usize) -> NetResult<()> {
        if cursor > self.used {
            return raise(ErrorKind::OutOfBounds, "positioning a packet cursor");
        }
        self.cursor = cursor;
        Ok(())
    }

    /// Empties the packet without touching the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.sync_cipher();
        self.used = 0;
        self.cursor = 0;
    }

    /// Allocates exactly `size` bytes, discarding the contents. Fails on a
    /// borrowed packet when `size > 0` because the borrowed block cannot be
    /// replaced.
    pub fn set_memory_size(&mut self, size: usize) -> NetResult<()> {
        self.sync_cipher();

        if self.is_borrowed() {
            if size > 0 {
                return raise(
                    ErrorKind::InvalidState,
                    "resizing a packet that borrows external storage",
                );
            }
            self.used = 0;
            self.cursor = 0;
            return Ok(());
        }

        self.storage = Storage::Owned(vec![0u8; size].into_boxed_slice());
        self.used = 0;
        self.cursor = 0;
        Ok(())
    }

    /// Reallocates to exactly `size` bytes preserving up to `min(used,
    /// size)` bytes of content. Shrinking never discards bytes below the new
    /// size; used and cursor clamp.
    pub fn change_memory_size(&mut self, size: usize) -> NetResult<()> {
        self.sync_cipher();

        if self.is_borrowed() {
            return raise(
                ErrorKind::InvalidState,
                "resizing a packet that borrows external storage",
            );
        }

        let keep = self.used.min(size);
        let mut fresh = vec![0u8; size].into_boxed_slice();
        fresh[..keep].copy_from_slice(&self.storage.as_slice()[..keep]);

        self.storage = Storage::Owned(fresh);
        self.used = keep;
        self.cursor = self.cursor.min(self.used);
        Ok(())
    }

    /// Grows the allocation to hold at least `needed` bytes.
    fn ensure_capacity(&mut self, needed: usize) -> NetResult<()> {
        if needed <= self.capacity() {
            return Ok(());
        }
        if self.is_borrowed() {
            return raise(
                ErrorKind::InvalidState,
                "growing a packet that borrows external storage",
            );
        }
        self.change_memory_size(needed)
    }

    // ---- add / get ------------------------------------------------------

    /// Writes `value` at the cursor, growing the buffer when needed.
    pub fn add<T: Wire>(&mut self, value: T) -> NetResult<()> {
        self.sync_cipher();
        self.ensure_capacity(self.cursor + T::SIZE)?;

        value.write_wire(&mut self.storage.as_mut_slice()[self.cursor..self.cursor + T::SIZE]);
        self.cursor += T::SIZE;
        self.used = self.used.max(self.cursor);
        Ok(())
    }

    /// Reads a `T` at the cursor.
    pub fn get<T: Wire>(&mut self) -> NetResult<T> {
        self.sync_cipher();
        if self.cursor + T::SIZE > self.used {
            return raise(ErrorKind::EndOfPacket, "reading a value from a packet");
        }

        let value = T::read_wire(&self.storage.as_slice()[self.cursor..self.cursor + T::SIZE]);
        self.cursor += T::SIZE;
        Ok(value)
    }

    /// Writes a width-normalized size: exactly [`PREFIX_SIZE`] wire bytes
    /// regardless of the native word size.
    #[inline]
    pub fn add_size(&mut self, value: usize) -> NetResult<()> {
        self.add::<u64>(value as u64)
    }

    /// Reads a width-normalized size.
    #[inline]
    pub fn get_size(&mut self) -> NetResult<usize> {
        Ok(self.get::<u64>()? as usize)
    }

    /// Writes a width-normalized age stamp.
    #[inline]
    pub fn add_age_stamp(&mut self, value: u64) -> NetResult<()> {
        self.add::<u64>(value)
    }

    /// Reads a width-normalized age stamp.
    #[inline]
    pub fn get_age_stamp(&mut self) -> NetResult<u64> {
        self.get::<u64>()
    }

    /// Writes raw bytes at the cursor, optionally preceded by a
    /// width-normalized length prefix.
    pub fn add_bytes(&mut self, bytes: &[u8], with_prefix: bool) -> NetResult<()> {
        self.sync_cipher();

        if with_prefix {
            self.add_size(bytes.len())?;
        }

        self.ensure_capacity(self.cursor + bytes.len())?;
        self.storage.as_mut_slice()[self.cursor..self.cursor + bytes.len()]
            .copy_from_slice(bytes);
        self.cursor += bytes.len();
        self.used = self.used.max(self.cursor);
        Ok(())
    }

    /// Writes a string; see [`Packet::add_bytes`].
    #[inline]
    pub fn add_str(&mut self, text: &str, with_prefix: bool) -> NetResult<()> {
        self.add_bytes(text.as_bytes(), with_prefix)
    }

    /// Reads `length` raw bytes at the cursor. `length == 0` consumes a
    /// width-normalized length prefix first.
    pub fn get_bytes(&mut self, length: usize) -> NetResult<Vec<u8>> {
        self.sync_cipher();

        let length = match length {
            0 => self.get_size()?,
            n => n,
        };

        if self.cursor + length > self.used {
            return raise(ErrorKind::EndOfPacket, "reading bytes from a packet");
        }

        let bytes = self.storage.as_slice()[self.cursor..self.cursor + length].to_vec();
        self.cursor += length;
        Ok(bytes)
    }

    /// Reads a string; see [`Packet::get_bytes`].
    pub fn get_str(&mut self, length: usize) -> NetResult<String> {
        let bytes = self.get_bytes(length)?;
        String::from_utf8(bytes)
            .or_else(|_| raise(ErrorKind::Protocol, "decoding a string from a packet"))
    }

    /// Appends bytes at the used size without disturbing the cursor. The
    /// TCP partial-packet store appends received data this way while its
    /// cursor tracks the parse position.
    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) -> NetResult<()> {
        self.sync_cipher();
        self.ensure_capacity(self.used + bytes.len())?;

        let start = self.used;
        self.storage.as_mut_slice()[start..start + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        Ok(())
    }

    /// Appends the used bytes of `other` at the cursor.
    pub fn add_packet(&mut self, other: &Packet) -> NetResult<()> {
        other.sync_cipher();
        self.add_bytes(other.bytes(), false)
    }

    // ---- insert / erase / find -----------------------------------------

    /// Opens a hole of `count` bytes at the cursor, shifting the tail up.
    /// The cursor does not move, so the hole can be written immediately.
    pub fn insert(&mut self, count: usize) -> NetResult<()> {
        self.sync_cipher();

        if self.cursor > self.used {
            return raise(ErrorKind::InvalidState, "inserting a hole into a packet");
        }

        self.ensure_capacity(self.used + count)?;
        let data = self.storage.as_mut_slice();
        data.copy_within(self.cursor..self.used, self.cursor + count);
        self.used += count;
        Ok(())
    }

    /// Removes `count` bytes starting at `start`, shifting the tail down.
    /// The cursor moves back by however much of the erased range lay before
    /// it.
    pub fn erase(&mut self, start: usize, count: usize) -> NetResult<()> {
        self.sync_cipher();

        if start + count > self.used {
            return raise(ErrorKind::OutOfBounds, "erasing bytes from a packet");
        }

        let data = self.storage.as_mut_slice();
        data.copy_within(start + count..self.used, start);
        self.used -= count;

        if self.cursor > start {
            self.cursor -= count.min(self.cursor - start);
        }
        Ok(())
    }

    /// Scans `[start, end)` (clamped to the used size) for the first match
    /// of `needle`.
    pub fn find(&self, start: usize, end: usize, needle: &[u8]) -> Option<usize> {
        self.sync_cipher();

        let end = end.min(self.used);
        if needle.is_empty() || start >= end || end - start < needle.len() {
            return None;
        }

        let data = &self.storage.as_slice()[start..end];
        data.windows(needle.len())
            .position(|window| window == needle)
            .map(|offset| start + offset)
    }

    // ---- borrowed storage ----------------------------------------------

    /// Installs borrowed storage: `data` points at `capacity` bytes owned
    /// elsewhere of which `used` are in use. The previous owned allocation
    /// is dropped.
    ///
    /// # Safety
    ///
    /// The pointee must be valid, writable and unaliased for the whole time
    /// the packet borrows it, and the packet must not be sent to another
    /// thread while borrowed.
    pub unsafe fn set_data_ptr(&mut self, data: *mut u8, capacity: usize, used: usize) {
        self.sync_cipher();
        self.storage = Storage::Borrowed { data, capacity };
        self.used = used.min(capacity);
        self.cursor = 0;
    }

    /// Restores ownership semantics with empty owned storage.
    pub fn unset_data_ptr(&mut self) {
        self.sync_cipher();
        if self.is_borrowed() {
            self.storage = Storage::Owned(Vec::new().into_boxed_slice());
            self.used = 0;
            self.cursor = 0;
        }
    }

    // ---- metadata -------------------------------------------------------

    #[inline]
    pub fn client_from(&self) -> ClientId {
        self.client_from
    }

    #[inline]
    pub fn set_client_from(&mut self, client: ClientId) {
        self.client_from = client;
    }

    #[inline]
    pub fn operation(&self) -> OperationId {
        self.operation
    }

    #[inline]
    pub fn set_operation(&mut self, operation: OperationId) {
        self.operation = operation;
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    #[inline]
    pub fn set_instance(&mut self, instance: InstanceId) {
        self.instance = instance;
    }

    #[inline]
    pub fn age(&self) -> u64 {
        self.age
    }

    #[inline]
    pub fn set_age(&mut self, age: u64) {
        self.age = age;
    }

    // ---- encryption -----------------------------------------------------

    /// Encrypts the used bytes in place, padding to the next whole cipher
    /// block first (16 bytes minimum). With `block` false the call returns
    /// once the work is posted; poll [`Packet::is_last_cipher_finished`] or
    /// wait with [`Packet::wait_last_cipher`]. The trailing pad is the
    /// caller's to strip after decryption.
    pub fn encrypt(&mut self, key: &Arc<CipherKey>, block: bool) -> NetResult<()> {
        self.sync_cipher();
        self.cipher = None;

        if self.used == 0 {
            return raise(ErrorKind::InvalidLength, "encrypting an empty packet");
        }

        let padded = match self.used % crypto::BLOCK_SIZE {
            0 => self.used,
            remainder => self.used + (crypto::BLOCK_SIZE - remainder),
        };

        self.ensure_capacity(padded)?;
        for n in self.used..padded {
            self.storage.as_mut_slice()[n] = 0;
        }
        self.used = padded;

        let handle = unsafe {
            crypto::run_parallel(self.storage.as_mut_slice().as_mut_ptr(), padded, key, true)?
        };

        if block {
            handle.wait(None);
        } else {
            self.cipher = Some(handle);
        }
        Ok(())
    }

    /// Decrypts the used bytes in place. The used size must be a nonzero
    /// multiple of the cipher block size.
    pub fn decrypt(&mut self, key: &Arc<CipherKey>, block: bool) -> NetResult<()> {
        self.sync_cipher();
        self.cipher = None;

        if self.used == 0 || self.used % crypto::BLOCK_SIZE != 0 {
            return raise(
                ErrorKind::InvalidLength,
                "decrypting a packet that is not a whole number of blocks",
            );
        }

        let handle = unsafe {
            crypto::run_parallel(
                self.storage.as_mut_slice().as_mut_ptr(),
                self.used,
                key,
                false,
            )?
        };

        if block {
            handle.wait(None);
        } else {
            self.cipher = Some(handle);
        }
        Ok(())
    }

    /// True when no cipher operation is outstanding.
    #[inline]
    pub fn is_last_cipher_finished(&self) -> bool {
        self.cipher.as_ref().map_or(true, CipherHandle::is_finished)
    }

    /// Waits for the outstanding cipher operation, if any.
    pub fn wait_last_cipher(&mut self) {
        self.sync_cipher();
        self.cipher = None;
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.sync_cipher();
    }
}

impl Clone for Packet {
    /// Deep copy. A clone of a borrowed packet owns its data.
    fn clone(&self) -> Self {
        self.sync_cipher();

        let mut copy = Packet::from_bytes(&self.storage.as_slice()[..self.used]);
        copy.cursor = self.cursor;
        copy.client_from = self.client_from;
        copy.operation = self.operation;
        copy.instance = self.instance;
        copy.age = self.age;
        copy
    }
}

impl PartialEq for Packet {
    /// Compares the used bytes and the metadata tuple. Capacity and cursor
    /// are not observable.
    fn eq(&self, other: &Self) -> bool {
        self.sync_cipher();
        other.sync_cipher();

        self.used == other.used
            && self.storage.as_slice()[..self.used] == other.storage.as_slice()[..other.used]
            && self.client_from == other.client_from
            && self.operation == other.operation
            && self.instance == other.instance
            && self.age == other.age
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("used", &self.used)
            .field("cursor", &self.cursor)
            .field("capacity", &self.capacity())
            .field("client_from", &self.client_from)
            .field("operation", &self.operation)
            .field("age", &self.age)
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

/// Fixed-width little-endian wire encoding for the primitive types a packet
/// can carry directly.
pub trait Wire: Sized {
    const SIZE: usize;
    fn write_wire(&self, dest: &mut [u8]);
    fn read_wire(src: &[u8]) -> Self;
}

macro_rules! wire_int {
    ($ty:ty, $size:expr, $write:ident, $read:ident) => {
        impl Wire for $ty {
            const SIZE: usize = $size;

            #[inline]
            fn write_wire(&self, dest: &mut [u8]) {
                LittleEndian::$write(dest, *self);
            }

            #[inline]
            fn read_wire(src: &[u8]) -> Self {
                LittleEndian::$read(src)
            }
        }
    };
}

wire_int!(u16, 2, write_u16, read_u16);
wire_int!(i16, 2, write_i16, read_i16);
wire_int!(u32, 4, write_u32, read_u32);
wire_int!(i32, 4, write_i32, read_i32);
wire_int!(u64, 8, write_u64, read_u64);
wire_int!(i64, 8, write_i64, read_i64);
wire_int!(f32, 4, write_f32, read_f32);
wire_int!(f64, 8, write_f64, read_f64);

impl Wire for u8 {
    const SIZE: usize = 1;

    #[inline]
    fn write_wire(&self, dest: &mut [u8]) {
        dest[0] = *self;
    }

    #[inline]
    fn read_wire(src: &[u8]) -> Self {
        src[0]
    }
}

impl Wire for i8 {
    const SIZE: usize = 1;

    #[inline]
    fn write_wire(&self, dest: &mut [u8]) {
        dest[0] = *self as u8;
    }

    #[inline]
    fn read_wire(src: &[u8]) -> Self {
        src[0] as i8
    }
}

impl Wire for bool {
    const SIZE: usize = 1;

    #[inline]
    fn write_wire(&self, dest: &mut [u8]) {
        dest[0] = *self as u8;
    }

    #[inline]
    fn read_wire(src: &[u8]) -> Self {
        src[0] != 0
    }
}
