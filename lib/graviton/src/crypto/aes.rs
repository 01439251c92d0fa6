//! AES-128/192/256 primitives: S-boxes, key expansion and the single-block
//! cipher. Blocks are flat 16-byte slices in column-major order, so the
//! state is the block itself; byte `i` sits in row `i % 4`, column `i / 4`.
//!
//! The S-boxes are derived (GF(2^8) inverse followed by the affine
//! transform) instead of transcribed; the FIPS-197 Appendix C vectors in the
//! tests pin them down.

use lazy_static::lazy_static;

pub const BLOCK_SIZE: usize = 16;

lazy_static! {
    static ref SBOXES: ([u8; 256], [u8; 256]) = build_sboxes();
}

#[inline]
fn sbox() -> &'static [u8; 256] {
    &SBOXES.0
}

#[inline]
fn inv_sbox() -> &'static [u8; 256] {
    &SBOXES.1
}

/// Multiplication in GF(2^8) modulo x^8 + x^4 + x^3 + x + 1.
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;

    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }

    product
}

fn build_sboxes() -> ([u8; 256], [u8; 256]) {
    let mut forward = [0u8; 256];
    let mut inverse = [0u8; 256];

    for x in 0..=255u8 {
        // Multiplicative inverse by exponentiation: x^254 == x^-1, with 0
        // mapping to 0.
        let mut inv = 0u8;
        if x != 0 {
            inv = 1;
            let mut power = x;
            let mut exponent = 254u32;
            while exponent != 0 {
                if exponent & 1 != 0 {
                    inv = gf_mul(inv, power);
                }
                power = gf_mul(power, power);
                exponent >>= 1;
            }
        }

        let s = inv
            ^ inv.rotate_left(1)
            ^ inv.rotate_left(2)
            ^ inv.rotate_left(3)
            ^ inv.rotate_left(4)
            ^ 0x63;

        forward[x as usize] = s;
        inverse[s as usize] = x;
    }

    (forward, inverse)
}

/// Expands `key` (16, 24 or 32 bytes) into the flat round-key schedule of
/// `16 * (rounds + 1)` bytes. Returns the schedule and the round count.
pub fn expand_key(key: &[u8]) -> (Vec<u8>, usize) {
    let nk = match key.len() {
        16 => 4,
        24 => 6,
        32 => 8,
        len => panic!("unsupported AES key length {}", len),
    };
    let rounds = nk + 6;
    let total_words = 4 * (rounds + 1);

    let mut schedule = vec![0u8; total_words * 4];
    schedule[..key.len()].copy_from_slice(key);

    let s = sbox();
    let mut rcon = 0x01u8;

    for i in nk..total_words {
        let mut word = [
            schedule[(i - 1) * 4],
            schedule[(i - 1) * 4 + 1],
            schedule[(i - 1) * 4 + 2],
            schedule[(i - 1) * 4 + 3],
        ];

        if i % nk == 0 {
            word.rotate_left(1);
            for byte in word.iter_mut() {
                *byte = s[*byte as usize];
            }
            word[0] ^= rcon;
            rcon = gf_mul(rcon, 2);
        } else if nk > 6 && i % nk == 4 {
            for byte in word.iter_mut() {
                *byte = s[*byte as usize];
            }
        }

        for n in 0..4 {
            schedule[i * 4 + n] = schedule[(i - nk) * 4 + n] ^ word[n];
        }
    }

    (schedule, rounds)
}

#[inline]
fn add_round_key(block: &mut [u8], schedule: &[u8], round: usize) {
    for n in 0..BLOCK_SIZE {
        block[n] ^= schedule[round * BLOCK_SIZE + n];
    }
}

#[inline]
fn sub_bytes(block: &mut [u8]) {
    let s = sbox();
    for byte in block.iter_mut() {
        *byte = s[*byte as usize];
    }
}

#[inline]
fn inv_sub_bytes(block: &mut [u8]) {
    let s = inv_sbox();
    for byte in block.iter_mut() {
        *byte = s[*byte as usize];
    }
}

/// Row `r` rotates left by `r` columns.
fn shift_rows(block: &mut [u8]) {
    let original = *array(block);
    for r in 1..4 {
        for c in 0..4 {
            block[r + 4 * c] = original[r + 4 * ((c + r) % 4)];
        }
    }
}

/// Row `r` rotates right by `r` columns.
fn inv_shift_rows(block: &mut [u8]) {
    let original = *array(block);
    for r in 1..4 {
        for c in 0..4 {
            block[r + 4 * ((c + r) % 4)] = original[r + 4 * c];
        }
    }
}

fn mix_columns(block: &mut [u8]) {
    for c in 0..4 {
        let col = [block[4 * c], block[4 * c + 1], block[4 * c + 2], block[4 * c + 3]];
        block[4 * c] = gf_mul(col[0], 2) ^ gf_mul(col[1], 3) ^ col[2] ^ col[3];
        block[4 * c + 1] = col[0] ^ gf_mul(col[1], 2) ^ gf_mul(col[2], 3) ^ col[3];
        block[4 * c + 2] = col[0] ^ col[1] ^ gf_mul(col[2], 2) ^ gf_mul(col[3], 3);
        block[4 * c + 3] = gf_mul(col[0], 3) ^ col[1] ^ col[2] ^ gf_mul(col[3], 2);
    }
}

fn inv_mix_columns(block: &mut [u8]) {
    for c in 0..4 {
        let col = [block[4 * c], block[4 * c + 1], block[4 * c + 2], block[4 * c + 3]];
        block[4 * c] = gf_mul(col[0], 0x0e)
            ^ gf_mul(col[1], 0x0b)
            ^ gf_mul(col[2], 0x0d)
            ^ gf_mul(col[3], 0x09);
        block[4 * c + 1] = gf_mul(col[0], 0x09)
            ^ gf_mul(col[1], 0x0e)
            ^ gf_mul(col[2], 0x0b)
            ^ gf_mul(col[3], 0x0d);
        block[4 * c + 2] = gf_mul(col[0], 0x0d)
            ^ gf_mul(col[1], 0x09)
            ^ gf_mul(col[2], 0x0e)
            ^ gf_mul(col[3], 0x0b);
        block[4 * c + 3] = gf_mul(col[0], 0x0b)
            ^ gf_mul(col[1], 0x0d)
            ^ gf_mul(col[2], 0x09)
            ^ gf_mul(col[3], 0x0e);
    }
}

#[inline]
fn array(block: &[u8]) -> &[u8; BLOCK_SIZE] {
    assert_eq!(block.len(), BLOCK_SIZE);
    unsafe { &*(block.as_ptr() as *const [u8; BLOCK_SIZE]) }
}

/// Encrypts one 16-byte block in place.
pub fn encrypt_block(block: &mut [u8], schedule: &[u8], rounds: usize) {
    assert_eq!(block.len(), BLOCK_SIZE);

    add_round_key(block, schedule, 0);
    for round in 1..rounds {
        sub_bytes(block);
        shift_rows(block);
        mix_columns(block);
        add_round_key(block, schedule, round);
    }
    sub_bytes(block);
    shift_rows(block);
    add_round_key(block, schedule, rounds);
}

/// Decrypts one 16-byte block in place.
pub fn decrypt_block(block: &mut [u8], schedule: &[u8], rounds: usize) {
    assert_eq!(block.len(), BLOCK_SIZE);

    add_round_key(block, schedule, rounds);
    for round in (1..rounds).rev() {
        inv_shift_rows(block);
        inv_sub_bytes(block);
        add_round_key(block, schedule, round);
        inv_mix_columns(block);
    }
    inv_shift_rows(block);
    inv_sub_bytes(block);
    add_round_key(block, schedule, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &str) -> Vec<u8> {
        (0..bytes.len())
            .step_by(2)
            .map(|n| u8::from_str_radix(&bytes[n..n + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_sbox_known_entries() {
        let s = sbox();
        assert_eq!(s[0x00], 0x63);
        assert_eq!(s[0x01], 0x7c);
        assert_eq!(s[0x53], 0xed);
        assert_eq!(s[0xff], 0x16);
    }

    #[test]
    fn test_sboxes_are_inverses() {
        let (forward, inverse) = (sbox(), inv_sbox());
        for x in 0..=255usize {
            assert_eq!(inverse[forward[x] as usize] as usize, x);
        }
    }

    #[test]
    fn test_gf_mul_examples() {
        // 0x57 * 0x83 = 0xc1 and 0x57 * 0x13 = 0xfe, from the FIPS-197
        // multiplication walkthrough.
        assert_eq!(gf_mul(0x57, 0x83), 0xc1);
        assert_eq!(gf_mul(0x57, 0x13), 0xfe);
    }

    #[test]
    fn test_fips197_aes128_vector() {
        let key = hex("000102030405060708090a0b0c0d0e0f");
        let (schedule, rounds) = expand_key(&key);
        assert_eq!(rounds, 10);

        let mut block = hex("00112233445566778899aabbccddeeff");
        encrypt_block(&mut block, &schedule, rounds);
        assert_eq!(block, hex("69c4e0d86a7b0430d8cdb78070b4c55a"));

        decrypt_block(&mut block, &schedule, rounds);
        assert_eq!(block, hex("00112233445566778899aabbccddeeff"));
    }

    #[test]
    fn test_fips197_aes192_vector() {
        let key = hex("000102030405060708090a0b0c0d0e0f1011121314151617");
        let (schedule, rounds) = expand_key(&key);
        assert_eq!(rounds, 12);

        let mut block = hex("00112233445566778899aabbccddeeff");
        encrypt_block(&mut block, &schedule, rounds);
        assert_eq!(block, hex("dda97ca4864cdfe06eaf70a0ec0d7191"));

        decrypt_block(&mut block, &schedule, rounds);
        assert_eq!(block, hex("00112233445566778899aabbccddeeff"));
    }

    #[test]
    fn test_fips197_aes256_vector() {
        let key = hex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f");
        let (schedule, rounds) = expand_key(&key);
        assert_eq!(rounds, 14);

        let mut block = hex("00112233445566778899aabbccddeeff");
        encrypt_block(&mut block, &schedule, rounds);
        assert_eq!(block, hex("8ea2b7ca516745bfeafc49904b496089"));

        decrypt_block(&mut block, &schedule, rounds);
        assert_eq!(block, hex("00112233445566778899aabbccddeeff"));
    }
}
