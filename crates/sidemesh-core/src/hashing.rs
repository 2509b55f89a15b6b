//! SHA-256 based key partitioning.
//!
//! Both the cache shard function and the validator's node routing reduce the
//! full 256-bit SHA-256 digest of the key, read as a big-endian integer,
//! modulo the bucket count. The two are used independently over the same key
//! space.

use sha2::{Digest, Sha256};

/// Hex encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `int(sha256(key)) mod buckets`. Returns 0 when `buckets` is 0.
pub fn sha256_mod(key: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    let modulus = buckets as u128;
    let digest = Sha256::digest(key.as_bytes());
    let rem = digest
        .iter()
        .fold(0u128, |acc, &byte| ((acc << 8) | u128::from(byte)) % modulus);
    // rem < buckets, so it fits
    rem as usize
}

/// Cache shard for a token id.
pub fn shard_index(token_id: &str, num_shards: usize) -> usize {
    sha256_mod(token_id, num_shards)
}

/// Picks the node responsible for `key` from an ordered node list.
pub fn route<'a, T>(key: &str, nodes: &'a [T]) -> Option<&'a T> {
    nodes.get(sha256_mod(key, nodes.len()))
}

/// Per-bucket key counts.
pub fn bucket_counts<I, K>(keys: I, buckets: usize) -> Vec<usize>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut counts = vec![0usize; buckets];
    if buckets == 0 {
        return counts;
    }
    for key in keys {
        counts[sha256_mod(key.as_ref(), buckets)] += 1;
    }
    counts
}

/// Largest relative deviation of a bucket from the uniform expectation.
///
/// `0.0` means perfectly uniform; `0.1` means some bucket holds 10% more or
/// fewer keys than `total / buckets`.
pub fn distribution_skew<I, K>(keys: I, buckets: usize) -> f64
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let counts = bucket_counts(keys, buckets);
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let expected = total as f64 / buckets as f64;
    counts
        .iter()
        .map(|&c| (c as f64 - expected).abs() / expected)
        .fold(0.0, f64::max)
}
