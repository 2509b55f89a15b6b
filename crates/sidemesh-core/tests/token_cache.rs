//! Integration tests for TokenCache with real RSA-PSS signatures.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use sidemesh_core::constants::MAX_CACHE_SKEW;
use sidemesh_core::{
    CacheConsistencyError, CacheLookup, MeshConfig, RsaPssVerifier, SignatureVerifier, Token,
    TokenCache, TokenValidationError,
};

use common::{now_secs, sign, signing_key, verifier, ManualClock};

/// Real verifier that counts how often it runs.
struct Counting {
    inner: RsaPssVerifier,
    calls: AtomicUsize,
}

impl SignatureVerifier for Counting {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), TokenValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.verify(message, signature)
    }
}

fn counting() -> Arc<Counting> {
    Arc::new(Counting {
        inner: verifier(),
        calls: AtomicUsize::new(0),
    })
}

fn fresh_token(id: &str) -> Token {
    sign(
        Token::new(id, 3600, now_secs())
            .with_claim("sub", "svc-orders")
            .with_claim("scope", "read"),
    )
}

#[test]
fn test_valid_token_is_verified_once_then_hit() {
    let counter = counting();
    let cache = TokenCache::new(16, counter.clone()).unwrap();
    let token = fresh_token("tok-valid");

    assert_eq!(cache.hit_rate(), 1.0);
    assert_eq!(cache.try_validate(&token).unwrap(), CacheLookup::Verified);
    assert_eq!(cache.try_validate(&token).unwrap(), CacheLookup::CacheHit);

    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.hit_rate(), 0.5);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_tampered_claims_fail_verification() {
    let cache = TokenCache::new(4, Arc::new(verifier())).unwrap();
    let mut token = fresh_token("tok-tampered");
    token.claims.insert("scope".into(), "admin".into());

    let err = cache.try_validate(&token).unwrap_err();
    assert!(
        matches!(err, TokenValidationError::SignatureInvalid { ref token_id } if token_id == "tok-tampered")
    );
    assert!(cache.is_empty());
}

#[test]
fn test_claim_order_is_part_of_the_signature() {
    let cache = TokenCache::new(4, Arc::new(verifier())).unwrap();
    let signed = fresh_token("tok-order");

    let mut reordered = signed.clone();
    reordered.claims.reverse();
    assert!(!cache.validate(&reordered));
    assert!(cache.validate(&signed));
}

#[test]
fn test_truncated_signature_is_malformed() {
    let cache = TokenCache::new(4, Arc::new(verifier())).unwrap();
    let mut token = fresh_token("tok-short");
    token.signature.truncate(10);

    let err = cache.try_validate(&token).unwrap_err();
    assert!(matches!(err, TokenValidationError::MalformedSignature { .. }));
    assert!(!cache.validate(&token));
}

#[test]
fn test_expired_entry_is_evicted_and_reverified() {
    let clock = ManualClock::at_secs(1_700_000_000);
    let counter = counting();
    let cache = TokenCache::new(8, counter.clone())
        .unwrap()
        .with_clock(clock.clone());
    let token = sign(Token::new("tok-short-lived", 30, 1_700_000_000.0));

    assert!(cache.validate(&token));
    assert!(cache.validate(&token));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

    clock.advance_secs(31);
    let err = cache.try_validate(&token).unwrap_err();
    assert!(matches!(err, TokenValidationError::Expired { .. }));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
}

#[test]
fn test_already_expired_token_is_never_cached() {
    let cache = TokenCache::new(4, Arc::new(verifier())).unwrap();
    let token = sign(Token::new("tok-old", 10, now_secs() - 3600.0));
    assert!(!cache.validate(&token));
    assert!(cache.is_empty());
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn test_concurrent_lookups_verify_once() {
    let counter = counting();
    let cache = Arc::new(TokenCache::new(4, counter.clone()).unwrap());
    let token = fresh_token("tok-contended");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let token = token.clone();
            thread::spawn(move || cache.validate(&token))
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    assert_eq!(stats.total, 8);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
}

fn random_ids(n: usize) -> Vec<String> {
    (0..n).map(|_| uuid::Uuid::new_v4().to_string()).collect()
}

#[test]
fn test_shard_mapping_is_stable_and_uniform() {
    let cache = TokenCache::new(16, Arc::new(verifier())).unwrap();
    assert_eq!(cache.shard_for("tok-1"), cache.shard_for("tok-1"));

    let ids = random_ids(100_000);
    let skew = cache.check_distribution(&ids, MAX_CACHE_SKEW).unwrap();
    assert!(skew < MAX_CACHE_SKEW, "skew {skew}");
}

#[test]
fn test_cache_from_config() {
    let config = MeshConfig::default()
        .with_num_shards(8)
        .with_max_cache_skew(0.05);
    let cache = TokenCache::from_config(&config, Arc::new(verifier())).unwrap();
    assert_eq!(cache.num_shards(), 8);
    assert_eq!(cache.max_skew(), 0.05);

    let ids = random_ids(100_000);
    let skew = cache.verify_distribution(&ids).unwrap();
    assert!(skew < 0.05, "skew {skew}");

    let strict = TokenCache::from_config(&config.clone().with_max_cache_skew(0.0), Arc::new(verifier()))
        .unwrap();
    assert!(matches!(
        strict.verify_distribution(&ids),
        Err(CacheConsistencyError::DistributionSkew { .. })
    ));

    let err = TokenCache::from_config(&MeshConfig::default().with_num_shards(0), Arc::new(verifier()))
        .unwrap_err();
    assert_eq!(err, CacheConsistencyError::ZeroShards);
}

#[test]
fn test_entries_live_in_their_shard() {
    let cache = TokenCache::new(7, Arc::new(verifier())).unwrap();
    for i in 0..20 {
        assert!(cache.validate(&fresh_token(&format!("tok-{i}"))));
    }
    cache.verify_shard_invariant().unwrap();
}

#[test]
fn test_verifier_loads_spki_and_pkcs1_pem() {
    let public = signing_key().to_public_key();
    let spki = public.to_public_key_pem(LineEnding::LF).unwrap();
    let pkcs1 = public.to_pkcs1_pem(LineEnding::LF).unwrap();

    let token = fresh_token("tok-pem");
    for pem in [spki, pkcs1] {
        let verifier = RsaPssVerifier::from_public_key_pem(&pem).unwrap();
        assert_eq!(verifier.salt_len(), 222);
        let cache = TokenCache::new(2, Arc::new(verifier)).unwrap();
        assert!(cache.validate(&token));
    }

    assert!(matches!(
        RsaPssVerifier::from_public_key_pem("-----BEGIN NOTHING-----"),
        Err(TokenValidationError::InvalidKey { .. })
    ));
}
