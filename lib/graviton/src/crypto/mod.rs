//! Packet encryption: AES keys built from integer tuples and the parallel
//! in-place cipher that partitions a buffer across the shared cipher pool.

pub mod aes;

use crate::support::{raise, ErrorKind, NetResult};
use crate::worker::{self, JobHandle, PoolKind, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

pub use self::aes::BLOCK_SIZE;

/// An expanded AES key. Construction mirrors the wire layout the runtime
/// uses everywhere else: the integer words are written little-endian into
/// the key bytes.
pub struct CipherKey {
    schedule: Vec<u8>,
    rounds: usize,
    bit_strength: usize,
}

impl CipherKey {
    /// 128-bit key from two 64-bit words.
    pub fn aes128(k1: u64, k2: u64) -> CipherKey {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&k1.to_le_bytes());
        bytes[8..].copy_from_slice(&k2.to_le_bytes());
        CipherKey::from_bytes(&bytes)
    }

    /// 192-bit key from three 64-bit words.
    pub fn aes192(k1: u64, k2: u64, k3: u64) -> CipherKey {
        let mut bytes = [0u8; 24];
        bytes[..8].copy_from_slice(&k1.to_le_bytes());
        bytes[8..16].copy_from_slice(&k2.to_le_bytes());
        bytes[16..].copy_from_slice(&k3.to_le_bytes());
        CipherKey::from_bytes(&bytes)
    }

    /// 256-bit key from four 64-bit words.
    pub fn aes256(k1: u64, k2: u64, k3: u64, k4: u64) -> CipherKey {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&k1.to_le_bytes());
        bytes[8..16].copy_from_slice(&k2.to_le_bytes());
        bytes[16..24].copy_from_slice(&k3.to_le_bytes());
        bytes[24..].copy_from_slice(&k4.to_le_bytes());
        CipherKey::from_bytes(&bytes)
    }

    /// Expands a raw 16/24/32-byte key.
    pub fn from_bytes(key: &[u8]) -> CipherKey {
        let (schedule, rounds) = aes::expand_key(key);
        CipherKey {
            schedule,
            rounds,
            bit_strength: key.len() * 8,
        }
    }

    #[inline]
    pub fn bit_strength(&self) -> usize {
        self.bit_strength
    }

    #[inline]
    pub fn rounds(&self) -> usize {
        self.rounds
    }
}

/// Completion handle covering every partition of one parallel cipher
/// operation.
pub struct CipherHandle {
    parts: Vec<JobHandle>,
}

impl CipherHandle {
    fn finished() -> CipherHandle {
        CipherHandle { parts: Vec::new() }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.parts.iter().all(JobHandle::is_finished)
    }

    /// Waits for every partition. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        use std::time::Instant;

        let deadline = timeout.map(|t| Instant::now() + t);
        for part in &self.parts {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return part.is_finished();
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if !part.wait(remaining) {
                return false;
            }
        }
        true
    }
}

/// A raw partition of packet storage shipped to a cipher worker. The poster
/// guarantees the memory outlives the job; the packet enforces this by
/// waiting on its cipher handle before any other operation.
struct Region {
    data: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}

impl Region {
    fn run(self, key: &CipherKey, encrypt: bool) {
        let blocks = unsafe { std::slice::from_raw_parts_mut(self.data, self.len) };

        for block in blocks.chunks_mut(BLOCK_SIZE) {
            if encrypt {
                aes::encrypt_block(block, &key.schedule, key.rounds);
            } else {
                aes::decrypt_block(block, &key.schedule, key.rounds);
            }
        }
    }
}

/// Ciphers `len` bytes at `data` in place, one contiguous block-aligned
/// partition per pool thread. Partition boundaries depend only on `len` and
/// the block size, never on the thread count, so output is identical for
/// any pool size.
///
/// # Safety
///
/// `data` must point to at least `len` writable bytes that stay valid and
/// unaliased until the returned handle reports finished.
pub(crate) unsafe fn run_parallel(
    data: *mut u8,
    len: usize,
    key: &Arc<CipherKey>,
    encrypt: bool,
) -> NetResult<CipherHandle> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return raise(
            ErrorKind::InvalidLength,
            "ciphering a buffer that is not a whole number of blocks",
        );
    }

    let pool: Arc<WorkerPool> = worker::shared_pool(PoolKind::Cipher);
    let workers = pool.size();
    let blocks = len / BLOCK_SIZE;

    let mut handle = CipherHandle::finished();

    for index in 0..workers {
        let first_block = index * blocks / workers;
        let last_block = (index + 1) * blocks / workers;
        if first_block == last_block {
            continue;
        }

        let region = Region {
            data: data.add(first_block * BLOCK_SIZE),
            len: (last_block - first_block) * BLOCK_SIZE,
        };
        let key = key.clone();
        let job = pool.post_at(index, move || region.run(&key, encrypt));
        handle.parts.push(job);
    }

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_strengths() {
        assert_eq!(CipherKey::aes128(1, 2).bit_strength(), 128);
        assert_eq!(CipherKey::aes128(1, 2).rounds(), 10);
        assert_eq!(CipherKey::aes192(1, 2, 3).bit_strength(), 192);
        assert_eq!(CipherKey::aes192(1, 2, 3).rounds(), 12);
        assert_eq!(CipherKey::aes256(1, 2, 3, 4).bit_strength(), 256);
        assert_eq!(CipherKey::aes256(1, 2, 3, 4).rounds(), 14);
    }

    #[test]
    fn test_tuple_key_matches_byte_key() {
        let from_words = CipherKey::aes128(0x0706050403020100, 0x0f0e0d0c0b0a0908);
        let from_bytes = CipherKey::from_bytes(&[
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
            0x0d, 0x0e, 0x0f,
        ]);
        assert_eq!(from_words.schedule, from_bytes.schedule);
    }

    #[test]
    fn test_parallel_roundtrip() {
        let key = Arc::new(CipherKey::aes256(11, 22, 33, 44));
        let mut data: Vec<u8> = (0..1024u32).map(|n| n as u8).collect();
        let original = data.clone();

        let handle =
            unsafe { run_parallel(data.as_mut_ptr(), data.len(), &key, true).unwrap() };
        assert!(handle.wait(None));
        assert_ne!(data, original);

        let handle =
            unsafe { run_parallel(data.as_mut_ptr(), data.len(), &key, false).unwrap() };
        assert!(handle.wait(None));
        assert_eq!(data, original);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let key = Arc::new(CipherKey::aes128(7, 9));
        let mut parallel: Vec<u8> = (0..512u32).map(|n| (n * 31) as u8).collect();
        let mut serial = parallel.clone();

        let handle = unsafe {
            run_parallel(parallel.as_mut_ptr(), parallel.len(), &key, true).unwrap()
        };
        assert!(handle.wait(None));

        for block in serial.chunks_mut(BLOCK_SIZE) {
            aes::encrypt_block(block, &key.schedule, key.rounds);
        }

        assert_eq!(parallel, serial);
    }

    #[test]
    fn test_invalid_length_is_refused() {
        let key = Arc::new(CipherKey::aes128(1, 2));
        let mut data = vec![0u8; 15];

        let err = unsafe { run_parallel(data.as_mut_ptr(), data.len(), &key, false) }
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidLength);

        let err = unsafe { run_parallel(data.as_mut_ptr(), 0, &key, false) }
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidLength);
    }
}
