//! Sharded, TTL-bounded cache of signature-verified tokens.
//!
//! Entries are spread over a fixed number of shards by
//! [`shard_index`](crate::hashing::shard_index). Each shard has its own lock,
//! and the whole check / evict / verify / insert sequence for a token runs
//! inside that shard's critical section.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::canonical::signing_payload;
use crate::config::MeshConfig;
use crate::constants::MAX_CACHE_SKEW;
use crate::error::{CacheConsistencyError, TokenValidationError};
use crate::hashing::{distribution_skew, shard_index};
use crate::hlc::{SystemClock, WallClock};
use crate::model::Token;

/// Checks a token signature over its canonical payload.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), TokenValidationError>;
}

/// RSA-PSS with MGF1/SHA-256 and the maximum salt length for the key.
#[derive(Clone)]
pub struct RsaPssVerifier {
    key: RsaPublicKey,
    salt_len: usize,
}

impl fmt::Debug for RsaPssVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaPssVerifier")
            .field("modulus_bits", &self.key.n().bits())
            .field("salt_len", &self.salt_len)
            .finish()
    }
}

/// `emLen - hLen - 2` for SHA-256, where `emLen = ceil((modBits - 1) / 8)`.
pub fn max_pss_salt_len(modulus_bits: usize) -> usize {
    let em_len = modulus_bits.saturating_sub(1).div_ceil(8);
    em_len.saturating_sub(Sha256::output_size() + 2)
}

impl RsaPssVerifier {
    pub fn new(key: RsaPublicKey) -> Self {
        let salt_len = max_pss_salt_len(key.n().bits());
        Self { key, salt_len }
    }

    /// Accepts an SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM.
    pub fn from_public_key_pem(pem: &str) -> Result<Self, TokenValidationError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| TokenValidationError::InvalidKey {
                reason: e.to_string(),
            })?;
        Ok(Self::new(key))
    }

    pub fn salt_len(&self) -> usize {
        self.salt_len
    }
}

impl SignatureVerifier for RsaPssVerifier {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), TokenValidationError> {
        if signature.len() != self.key.size() {
            return Err(TokenValidationError::MalformedSignature {
                token_id: String::new(),
                reason: format!(
                    "expected {} signature bytes, got {}",
                    self.key.size(),
                    signature.len()
                ),
            });
        }
        let digest = Sha256::digest(message);
        self.key
            .verify(Pss::new_with_salt::<Sha256>(self.salt_len), &digest, signature)
            .map_err(|_| TokenValidationError::SignatureInvalid {
                token_id: String::new(),
            })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: Token,
    /// Unix seconds after which the entry is stale.
    expires_at: f64,
}

type Shard = HashMap<String, CachedToken>;

/// How a successful [`TokenCache::try_validate`] was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    CacheHit,
    /// Missed, verified, now cached.
    Verified,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub total: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
}

/// Sharded token cache.
pub struct TokenCache {
    shards: Vec<Mutex<Shard>>,
    verifier: Arc<dyn SignatureVerifier>,
    clock: Arc<dyn WallClock>,
    /// Shard skew tolerated by [`TokenCache::verify_distribution`].
    max_skew: f64,
    total: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("num_shards", &self.shards.len())
            .field("max_skew", &self.max_skew)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    pub fn new(
        num_shards: usize,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, CacheConsistencyError> {
        if num_shards == 0 {
            return Err(CacheConsistencyError::ZeroShards);
        }
        Ok(Self {
            shards: (0..num_shards).map(|_| Mutex::new(Shard::new())).collect(),
            verifier,
            clock: Arc::new(SystemClock),
            max_skew: MAX_CACHE_SKEW,
            total: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Cache with the configured shard count and skew tolerance.
    pub fn from_config(
        config: &MeshConfig,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, CacheConsistencyError> {
        Ok(Self::new(config.num_shards, verifier)?.with_max_skew(config.max_cache_skew))
    }

    pub fn with_max_skew(mut self, max_skew: f64) -> Self {
        self.max_skew = max_skew;
        self
    }

    pub fn max_skew(&self) -> f64 {
        self.max_skew
    }

    /// Replaces the wall clock used for expiry decisions.
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, token_id: &str) -> usize {
        shard_index(token_id, self.shards.len())
    }

    fn lock_shard(&self, index: usize) -> MutexGuard<'_, Shard> {
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` for a cache hit or a freshly verified token; `false` otherwise.
    pub fn validate(&self, token: &Token) -> bool {
        match self.try_validate(token) {
            Ok(_) => true,
            Err(e) => {
                debug!(token_id = %token.id, error = %e, "token rejected");
                false
            }
        }
    }

    /// Looks the token up, verifying and caching it on a miss.
    ///
    /// A stale entry is evicted and the lookup continues as a miss. On a miss
    /// the signature is checked first and expiry second; tokens failing
    /// either are not cached.
    pub fn try_validate(&self, token: &Token) -> Result<CacheLookup, TokenValidationError> {
        self.total.fetch_add(1, Ordering::Relaxed);
        let shard_idx = self.shard_for(&token.id);
        let now = self.clock.now_secs();
        let mut shard = self.lock_shard(shard_idx);

        match shard.get(&token.id).map(|cached| now <= cached.expires_at) {
            Some(true) => return Ok(CacheLookup::CacheHit),
            Some(false) => {
                debug!(token_id = %token.id, shard = shard_idx, "evicting expired token");
                shard.remove(&token.id);
            }
            None => {}
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.verify_signature(token)?;

        if token.is_expired_at(now) {
            return Err(TokenValidationError::Expired {
                token_id: token.id.clone(),
                expired_at: token.expires_at(),
            });
        }

        shard.insert(
            token.id.clone(),
            CachedToken {
                token: token.clone(),
                expires_at: token.expires_at(),
            },
        );
        debug!(token_id = %token.id, shard = shard_idx, "token verified and cached");
        Ok(CacheLookup::Verified)
    }

    fn verify_signature(&self, token: &Token) -> Result<(), TokenValidationError> {
        let payload = signing_payload(token)?;
        self.verifier
            .verify(&payload, &token.signature)
            .map_err(|e| match e {
                TokenValidationError::SignatureInvalid { .. } => {
                    TokenValidationError::SignatureInvalid {
                        token_id: token.id.clone(),
                    }
                }
                TokenValidationError::MalformedSignature { reason, .. } => {
                    TokenValidationError::MalformedSignature {
                        token_id: token.id.clone(),
                        reason,
                    }
                }
                other => other,
            })
    }

    /// Lookup without verification. Counts toward the hit rate and evicts a
    /// stale entry.
    pub fn contains(&self, token: &Token) -> bool {
        self.total.fetch_add(1, Ordering::Relaxed);
        let shard_idx = self.shard_for(&token.id);
        let now = self.clock.now_secs();
        let mut shard = self.lock_shard(shard_idx);

        let fresh = match shard.get(&token.id).map(|cached| now <= cached.expires_at) {
            Some(true) => true,
            Some(false) => {
                shard.remove(&token.id);
                false
            }
            None => false,
        };
        if !fresh {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Caches a token vouched for elsewhere. The entry lives for `ttl` or
    /// until the token itself expires, whichever comes first.
    pub fn insert(&self, token: &Token, ttl: Duration) {
        let now = self.clock.now_secs();
        let expires_at = token.expires_at().min(now + ttl.as_secs_f64());
        let shard_idx = self.shard_for(&token.id);
        self.lock_shard(shard_idx).insert(
            token.id.clone(),
            CachedToken {
                token: token.clone(),
                expires_at,
            },
        );
    }

    /// Cached copy of a token, if present and fresh.
    pub fn get(&self, token_id: &str) -> Option<Token> {
        let now = self.clock.now_secs();
        let shard = self.lock_shard(self.shard_for(token_id));
        shard
            .get(token_id)
            .filter(|cached| now <= cached.expires_at)
            .map(|cached| cached.token.clone())
    }

    /// `1 - misses / total`, or `1.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let misses = self.misses.load(Ordering::Relaxed);
        1.0 - misses as f64 / total as f64
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total: self.total.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            entries: self.len(),
        }
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len())
            .map(|i| self.lock_shard(i).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every stale entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let mut removed = 0;
        for i in 0..self.shards.len() {
            let mut shard = self.lock_shard(i);
            let before = shard.len();
            shard.retain(|_, cached| now <= cached.expires_at);
            removed += before - shard.len();
        }
        if removed > 0 {
            debug!(removed, "purged expired tokens");
        }
        removed
    }

    /// Every entry sits in the shard its id hashes to.
    pub fn verify_shard_invariant(&self) -> Result<(), CacheConsistencyError> {
        for actual in 0..self.shards.len() {
            let shard = self.lock_shard(actual);
            for token_id in shard.keys() {
                let expected = self.shard_for(token_id);
                if expected != actual {
                    warn!(token_id, expected, actual, "cache shard invariant violated");
                    return Err(CacheConsistencyError::MisplacedEntry {
                        token_id: token_id.clone(),
                        expected,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks that `sample` ids spread over the shards within `tolerance`.
    pub fn check_distribution<I, K>(
        &self,
        sample: I,
        tolerance: f64,
    ) -> Result<f64, CacheConsistencyError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let skew = distribution_skew(sample, self.shards.len());
        if skew > tolerance {
            return Err(CacheConsistencyError::DistributionSkew { skew, tolerance });
        }
        Ok(skew)
    }

    /// [`check_distribution`](Self::check_distribution) against the
    /// cache's own skew tolerance.
    pub fn verify_distribution<I, K>(&self, sample: I) -> Result<f64, CacheConsistencyError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.check_distribution(sample, self.max_skew)
    }
}
