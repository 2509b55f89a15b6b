//! Control plane for a zero-trust mesh of serverless functions.
//!
//! This crate provides:
//!
//! - Per-function mTLS sidecar provisioning with rollback
//! - A sharded, TTL-bounded token cache with RSA-PSS verification
//! - Cluster token validation with identity provider fallback
//! - Policy propagation ordered by a hybrid logical clock
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sidemesh_core::{RsaPssVerifier, Token, TokenCache};
//!
//! # fn example(public_key_pem: &str, token: Token) -> sidemesh_core::Result<()> {
//! let verifier = RsaPssVerifier::from_public_key_pem(public_key_pem)?;
//! let cache = TokenCache::new(16, Arc::new(verifier))?;
//!
//! if cache.validate(&token) {
//!     println!("authorized, hit rate {:.2}", cache.hit_rate());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `SIDEMESH_MAX_CACHE_SKEW` | Allowed shard skew (default: 0.1) |
//! | `SIDEMESH_POLICY_CONVERGENCE_TIMEOUT` | Seconds (default: 5) |
//! | `SIDEMESH_HLC_CLOCK_DRIFT` | Seconds (default: 0.01) |
//! | `SIDEMESH_CACHE_SHARDS` | Token cache shards (default: 16) |
//! | `SIDEMESH_FIP_URL` | Identity provider validation endpoint |
//! | `SIDEMESH_FIP_TIMEOUT` | Seconds (default: 5) |
//! | `SIDEMESH_HANDSHAKE_TIMEOUT` | Seconds (default: 5) |
//! | `SIDEMESH_CA_CERT` / `SIDEMESH_CA_KEY` | Mesh CA PEM files |
//! | `SIDEMESH_SIDECAR_BASE_PORT` | First sidecar port (default: 8000) |
//! | `SIDEMESH_POLICY_CHANNEL` | Policy pub/sub channel (default: `policy_updates`) |

pub mod cache;
pub mod canonical;
pub mod config;
pub mod constants;
pub mod error;
pub mod hashing;
pub mod hlc;
pub mod model;
pub mod mtls;
pub mod policy;
pub mod provisioner;
pub mod validator;

// Re-export main types
pub use cache::{CacheLookup, CacheStats, RsaPssVerifier, SignatureVerifier, TokenCache};
pub use config::MeshConfig;
pub use error::{
    CacheConsistencyError, ClockError, ConfigError, MtlsError, PolicyPropagationError, Result,
    SidecarProvisioningError, SidemeshError, TokenValidationError,
};
pub use hlc::{HybridLogicalClock, SystemClock, Version, WallClock};
pub use model::{ClaimValue, Claims, Function, Policy, Sidecar, SidecarState, Token};
pub use mtls::{answer_probe, MtlsManager, SidecarCredentials};
pub use policy::{LocalBus, MemoryPolicyStore, PolicyBus, PolicyManager, PolicyStore};
pub use provisioner::{
    CredentialAuthority, DeploymentBackend, ProvisionOutcome, SidecarProvisioner,
};
pub use validator::{CacheNode, FipClient, IdentityProvider, TokenValidator};
