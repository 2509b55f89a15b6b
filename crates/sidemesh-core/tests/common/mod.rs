//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rsa::{Pss, RsaPrivateKey};
use sha2::{Digest, Sha256};
use sidemesh_core::cache::max_pss_salt_len;
use sidemesh_core::canonical::signing_payload;
use sidemesh_core::{MtlsManager, RsaPssVerifier, Token, WallClock};

pub const KEY_BITS: usize = 2048;

/// One signing key per test binary; RSA keygen is slow.
pub fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS).expect("failed to generate RSA key")
    })
}

pub fn verifier() -> RsaPssVerifier {
    RsaPssVerifier::new(signing_key().to_public_key())
}

/// Signs the canonical payload the way the token issuer does.
pub fn sign(token: Token) -> Token {
    let payload = signing_payload(&token).expect("payload");
    let digest = Sha256::digest(&payload);
    let signature = signing_key()
        .sign_with_rng(
            &mut rand::thread_rng(),
            Pss::new_with_salt::<Sha256>(max_pss_salt_len(KEY_BITS)),
            &digest,
        )
        .expect("failed to sign token");
    token.with_signature(signature)
}

pub fn now_secs() -> f64 {
    sidemesh_core::SystemClock.now_secs()
}

/// Wall clock the test moves by hand.
#[derive(Debug)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn at_secs(secs: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(secs * 1_000_000)))
    }

    pub fn advance_secs(&self, secs: u64) {
        self.0.fetch_add(secs * 1_000_000, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Self-signed CA as `(certificate_pem, key_pem)`.
pub fn test_ca(name: &str) -> (String, String) {
    let key = KeyPair::generate().expect("CA key");
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let cert = params.self_signed(&key).expect("self-signed CA");
    (cert.pem(), key.serialize_pem())
}

pub fn test_manager(name: &str) -> MtlsManager {
    let (cert, key) = test_ca(name);
    MtlsManager::from_pem(&cert, &key).expect("CA loads")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
