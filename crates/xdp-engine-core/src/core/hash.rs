// SPDX-License-Identifier: GPL-2.0

//! Byte hashing shared by the `hash_bytes` helper and host-side mirrors
//!
//! FNV-1a over the input followed by the murmur3 32-bit finalizer, so that
//! short keys differing in a single byte still spread over all output bits.

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Hash a byte string to 32 bits
pub fn hash_bytes(data: &[u8]) -> u32 {
    let mut h = FNV_OFFSET;
    for b in data {
        h ^= u32::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    fmix32(h)
}

/// Hash a byte string together with a 32-bit seed
pub fn hash_bytes_seeded(seed: u32, data: &[u8]) -> u32 {
    let mut h = FNV_OFFSET ^ fmix32(seed);
    for b in data {
        h ^= u32::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    fmix32(h)
}

/// murmur3 finalizer
pub fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(hash_bytes(b"flow"), hash_bytes(b"flow"));
        assert_ne!(hash_bytes(b"flow"), hash_bytes(b"flox"));
    }

    #[test]
    fn test_seed_changes_hash() {
        assert_ne!(hash_bytes_seeded(1, b"k"), hash_bytes_seeded(2, b"k"));
    }
}
