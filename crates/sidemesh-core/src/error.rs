//! Error types for the mesh control plane.
//!
//! Validation and provisioning failures are converted to `false` / failed
//! outcomes at the component boundary; these types carry the reason so the
//! caller can log it. Only CA credential loading and shard invariant
//! violations are meant to be treated as fatal.

use std::time::Duration;

/// Token could not be validated (signature, expiry, or remote authority).
#[derive(Debug, thiserror::Error)]
pub enum TokenValidationError {
    /// Token lifetime elapsed.
    #[error("token {token_id} expired at {expired_at}")]
    Expired { token_id: String, expired_at: f64 },

    /// Signature did not verify under the mesh key.
    #[error("signature verification failed for token {token_id}")]
    SignatureInvalid { token_id: String },

    /// Signature bytes have the wrong shape for the key.
    #[error("malformed signature for token {token_id}: {reason}")]
    MalformedSignature { token_id: String, reason: String },

    /// Canonical payload could not be encoded.
    #[error("failed to encode signing payload: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Verification key could not be loaded.
    #[error("invalid verification key: {reason}")]
    InvalidKey { reason: String },

    /// Identity provider answered with a non-success status.
    #[error("identity provider returned status {status}")]
    Remote { status: u16 },

    /// Identity provider could not be reached.
    #[error("identity provider transport error: {message}")]
    Transport { message: String },

    /// Identity provider did not answer in time.
    #[error("identity provider timed out")]
    Timeout,
}

impl TokenValidationError {
    /// Whether a later attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout)
    }
}

impl From<reqwest::Error> for TokenValidationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport {
                message: err.to_string(),
            }
        }
    }
}

/// Policy could not be persisted, broadcast, or merged.
#[derive(Debug, thiserror::Error)]
pub enum PolicyPropagationError {
    /// Durable store rejected the write or read.
    #[error("policy store error: {message}")]
    Store { message: String },

    /// Broadcast failed.
    #[error("failed to publish on {channel}: {message}")]
    Publish { channel: String, message: String },

    /// Subscription could not be established.
    #[error("failed to subscribe to {channel}: {message}")]
    Subscribe { channel: String, message: String },

    /// Inbound message was not a policy.
    #[error("invalid policy message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Expected version did not arrive within the convergence timeout.
    #[error("policy {id} did not converge to version {version} within {timeout:?}")]
    ConvergenceTimeout {
        id: String,
        version: String,
        timeout: Duration,
    },
}

impl PolicyPropagationError {
    /// Whether the next update or a redelivery might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::Publish { .. } | Self::Subscribe { .. }
        )
    }
}

/// Hybrid logical clock rejected a remote stamp.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("remote stamp is {ahead:?} ahead of wall clock (tolerance {tolerance:?})")]
    FutureSkew { ahead: Duration, tolerance: Duration },
}

/// A step of the sidecar provisioning workflow failed.
#[derive(Debug, thiserror::Error)]
pub enum SidecarProvisioningError {
    /// Identity credentials could not be issued.
    #[error("credential issuance failed for {sidecar_id}: {source}")]
    Credentials {
        sidecar_id: String,
        #[source]
        source: MtlsError,
    },

    /// No free port above the base port.
    #[error("no free sidecar port at or above {base}")]
    PortsExhausted { base: u16 },

    #[error("deployment of {sidecar_id} failed")]
    Deploy { sidecar_id: String },

    #[error("networking setup for {sidecar_id} failed")]
    Networking { sidecar_id: String },

    #[error("certificate installation on {sidecar_id} failed")]
    CertificateInstall { sidecar_id: String },

    /// The mTLS handshake or liveness probe failed.
    #[error("verification of {sidecar_id} failed: {source}")]
    Verification {
        sidecar_id: String,
        #[source]
        source: MtlsError,
    },

    /// State machine was asked for a transition it does not allow.
    #[error("invalid sidecar transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl SidecarProvisioningError {
    /// Sidecar the failure belongs to, when one had been created.
    pub fn sidecar_id(&self) -> Option<&str> {
        match self {
            Self::Credentials { sidecar_id, .. }
            | Self::Deploy { sidecar_id }
            | Self::Networking { sidecar_id }
            | Self::CertificateInstall { sidecar_id }
            | Self::Verification { sidecar_id, .. } => Some(sidecar_id),
            Self::PortsExhausted { .. } | Self::InvalidTransition { .. } => None,
        }
    }
}

/// Shard invariant violation. Indicates a bug, not a runtime condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheConsistencyError {
    #[error("cache needs at least one shard")]
    ZeroShards,

    #[error("token {token_id} stored in shard {actual}, hashes to shard {expected}")]
    MisplacedEntry {
        token_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("shard distribution skew {skew:.4} exceeds tolerance {tolerance:.4}")]
    DistributionSkew { skew: f64, tolerance: f64 },
}

/// Certificate authority or mTLS failure.
#[derive(Debug, thiserror::Error)]
pub enum MtlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// PEM material could not be parsed.
    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Host is neither a DNS name nor an IP address.
    #[error("invalid host name: {0}")]
    InvalidHost(String),

    /// Peer answered the liveness probe with something other than the ack.
    #[error("unexpected probe response: {received:?}")]
    Probe { received: String },

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

impl From<rustls::Error> for MtlsError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

/// Configuration value rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("missing required setting {key}")]
    Missing { key: String },
}

/// Any error produced by the crate.
#[derive(Debug, thiserror::Error)]
pub enum SidemeshError {
    #[error(transparent)]
    TokenValidation(#[from] TokenValidationError),

    #[error(transparent)]
    PolicyPropagation(#[from] PolicyPropagationError),

    #[error(transparent)]
    SidecarProvisioning(#[from] SidecarProvisioningError),

    #[error(transparent)]
    CacheConsistency(#[from] CacheConsistencyError),

    #[error(transparent)]
    Mtls(#[from] MtlsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Clock(#[from] ClockError),
}

/// Result type for mesh operations.
pub type Result<T, E = SidemeshError> = std::result::Result<T, E>;
