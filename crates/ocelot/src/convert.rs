//! Conversions between Starknet types and the persisted byte formats.
//!
//! Addresses and token ids are stored as fixed-width 32-byte big-endian
//! blobs so equality and range filters on the store are memcmp-correct.

use starknet::core::types::{Felt, U256};

/// Convert a Felt to a 32-byte BLOB for storage (big-endian).
pub fn felt_to_blob(felt: Felt) -> Vec<u8> {
    felt.to_bytes_be().to_vec()
}

/// Convert a BLOB back to a Felt (big-endian).
pub fn blob_to_felt(bytes: &[u8]) -> Felt {
    let mut arr = [0u8; 32];
    let len = bytes.len().min(32);
    // Right-align for big-endian (pad zeros on the left)
    arr[32 - len..].copy_from_slice(&bytes[..len]);
    Felt::from_bytes_be(&arr)
}

/// Convert a U256 token id to a 32-byte BLOB (big-endian).
pub fn u256_to_blob(value: U256) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&value.high().to_be_bytes());
    out.extend_from_slice(&value.low().to_be_bytes());
    out
}

/// Convert a BLOB back to a U256 (big-endian).
pub fn blob_to_u256(bytes: &[u8]) -> U256 {
    let mut arr = [0u8; 32];
    let len = bytes.len().min(32);
    arr[32 - len..].copy_from_slice(&bytes[..len]);

    let mut high = [0u8; 16];
    high.copy_from_slice(&arr[..16]);
    let mut low = [0u8; 16];
    low.copy_from_slice(&arr[16..]);

    U256::from_words(u128::from_be_bytes(low), u128::from_be_bytes(high))
}

/// Widen a felt into a 256-bit integer.
pub fn felt_to_u256(felt: Felt) -> U256 {
    blob_to_u256(&felt.to_bytes_be())
}

/// Narrow a 256-bit value back into a felt via its big-endian bytes.
///
/// Only used for values that originated as a single felt, so the
/// conversion is exact.
pub fn u256_to_felt(value: U256) -> Felt {
    let mut arr = [0u8; 32];
    arr[..16].copy_from_slice(&value.high().to_be_bytes());
    arr[16..].copy_from_slice(&value.low().to_be_bytes());
    Felt::from_bytes_be(&arr)
}

/// Encode an owner sequence as concatenated 32-byte addresses,
/// order-preserving.
pub fn owners_to_blob(owners: &[Felt]) -> Vec<u8> {
    let mut out = Vec::with_capacity(owners.len() * 32);
    for owner in owners {
        out.extend_from_slice(&owner.to_bytes_be());
    }
    out
}

/// Decode an owner sequence from its concatenated 32-byte encoding.
/// A trailing partial chunk is ignored.
pub fn blob_to_owners(bytes: &[u8]) -> Vec<Felt> {
    bytes.chunks_exact(32).map(blob_to_felt).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn felt_blob_roundtrip() {
        let felt = Felt::from(0xdeadbeefu64);
        let blob = felt_to_blob(felt);
        assert_eq!(blob.len(), 32);
        assert_eq!(blob_to_felt(&blob), felt);
    }

    #[test]
    fn u256_blob_is_fixed_width() {
        let small = U256::from(16u64);
        let blob = u256_to_blob(small);
        assert_eq!(blob.len(), 32);
        assert_eq!(blob_to_u256(&blob), small);

        let wide = U256::from_words(7, 3);
        assert_eq!(blob_to_u256(&u256_to_blob(wide)), wide);
    }

    #[test]
    fn u256_blob_orders_like_integers() {
        // memcmp on the fixed-width encoding must match integer order
        let a = u256_to_blob(U256::from(255u64));
        let b = u256_to_blob(U256::from(256u64));
        let c = u256_to_blob(U256::from_words(0, 1));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn felt_widens_exactly() {
        let felt = Felt::from(16u64);
        let wide = felt_to_u256(felt);
        assert_eq!(wide, U256::from(16u64));
        assert_eq!(u256_to_felt(wide), felt);
    }

    #[test]
    fn owners_roundtrip_preserves_order() {
        let owners = vec![Felt::from(1u64), Felt::from(3u64), Felt::from(2u64)];
        let blob = owners_to_blob(&owners);
        assert_eq!(blob.len(), 96);
        assert_eq!(blob_to_owners(&blob), owners);
    }

    #[test]
    fn empty_owners_roundtrip() {
        assert!(owners_to_blob(&[]).is_empty());
        assert!(blob_to_owners(&[]).is_empty());
    }
}
