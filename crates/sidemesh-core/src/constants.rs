//! Mesh-wide constants and protocol literals.

use std::time::Duration;

/// Default token TTL in seconds.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Maximum allowed relative deviation of any shard from a uniform distribution.
pub const MAX_CACHE_SKEW: f64 = 0.1;

/// How long a node waits for an expected policy version before declaring inconsistency.
pub const POLICY_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Allowed clock drift for the hybrid logical clock.
pub const HLC_CLOCK_DRIFT: Duration = Duration::from_millis(10);

/// Default number of token cache shards.
pub const DEFAULT_NUM_SHARDS: usize = 16;

/// First port handed out to sidecars.
pub const SIDECAR_BASE_PORT: u16 = 8000;

/// Default timeout for the sidecar verification handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for calls to the federated identity provider.
pub const DEFAULT_FIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Validity window of issued sidecar certificates.
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Liveness probe written by the provisioner after the mTLS handshake.
pub const VERIFY_PROBE: &[u8] = b"VERIFY";

/// Acknowledgement a healthy sidecar answers the probe with.
pub const VERIFY_ACK: &[u8] = b"OK";

/// Pub/sub channel policy updates are broadcast on.
pub const DEFAULT_POLICY_CHANNEL: &str = "policy_updates";

/// Durable store key prefix for policies (`policy:<id>`).
pub const POLICY_KEY_PREFIX: &str = "policy:";
