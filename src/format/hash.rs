//! Key hashing

/// Signature of a key hash function
pub type HashFn = fn(&[u8]) -> u32;

/// Default key hash, derived from the gdbm hash
pub fn default_hash(key: &[u8]) -> u32 {
    let mut value = 0x238F_13AFu32.wrapping_mul(key.len() as u32);
    for (i, &byte) in key.iter().enumerate() {
        let shift = (i as u32).wrapping_mul(5) % 24;
        value = value.wrapping_add((byte as u32) << shift);
    }
    1_103_515_243u32.wrapping_mul(value).wrapping_add(12345)
}
