//! Mesh data model: tokens, functions, sidecars, policies.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_TOKEN_TTL_SECS;
use crate::error::SidecarProvisioningError;
use crate::hlc::Version;
use crate::mtls::SidecarCredentials;

/// Insertion-ordered token claims. Order is part of the signed encoding.
pub type Claims = IndexMap<String, ClaimValue>;

/// A primitive claim value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl From<&str> for ClaimValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ClaimValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ClaimValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ClaimValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<f64> for ClaimValue {
    /// Non-finite floats have no JSON form and become `Null`.
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

/// A bearer token presented to the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    /// Lifetime in seconds, counted from `issued_at`. Issuers that omit it
    /// get the mesh default.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default)]
    pub claims: Claims,
    /// RSA-PSS signature over the canonical `{id, claims, issued_at}` encoding.
    #[serde(with = "base64_bytes", default)]
    pub signature: Vec<u8>,
    /// Seconds since the Unix epoch.
    pub issued_at: f64,
}

fn default_ttl() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

impl Token {
    pub fn new(id: impl Into<String>, ttl: u64, issued_at: f64) -> Self {
        Self {
            id: id.into(),
            ttl,
            claims: Claims::new(),
            signature: Vec::new(),
            issued_at,
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<ClaimValue>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    pub fn expires_at(&self) -> f64 {
        self.issued_at + self.ttl as f64
    }

    /// `now - issued_at > ttl`.
    pub fn is_expired_at(&self, now: f64) -> bool {
        now - self.issued_at > self.ttl as f64
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A serverless function instance. Supplied by the platform, read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub node: String,
    pub port: u16,
    pub namespace: String,
    #[serde(default)]
    pub resource_limits: BTreeMap<String, String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl Function {
    pub fn new(id: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node: node.into(),
            port: 0,
            namespace: "default".to_string(),
            resource_limits: BTreeMap::new(),
            env_vars: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Sidecar lifecycle. Failure is terminal and leaves no record behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SidecarState {
    Idle,
    Provisioning,
    Ready,
}

impl SidecarState {
    /// `Idle -> Provisioning -> Ready`, nothing else.
    pub fn can_transition_to(self, next: SidecarState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Provisioning) | (Self::Provisioning, Self::Ready)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Provisioning => "PROVISIONING",
            Self::Ready => "READY",
        }
    }
}

impl fmt::Display for SidecarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-function security proxy.
#[derive(Debug, Clone)]
pub struct Sidecar {
    pub id: String,
    pub node: String,
    pub port: u16,
    state: SidecarState,
    credentials: Option<SidecarCredentials>,
    function_id: Option<String>,
}

impl Sidecar {
    /// Sidecar id derived from the function it fronts.
    pub fn id_for(function_id: &str) -> String {
        format!("sidecar-{function_id}")
    }

    pub fn new(id: impl Into<String>, node: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            node: node.into(),
            port,
            state: SidecarState::Idle,
            credentials: None,
            function_id: None,
        }
    }

    pub fn state(&self) -> SidecarState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SidecarState::Ready
    }

    pub fn function_id(&self) -> Option<&str> {
        self.function_id.as_deref()
    }

    pub fn cert_pem(&self) -> Option<&str> {
        self.credentials.as_ref().map(SidecarCredentials::certificate_pem)
    }

    pub fn private_key_pem(&self) -> Option<&str> {
        self.credentials.as_ref().map(SidecarCredentials::private_key_pem)
    }

    pub fn credentials(&self) -> Option<&SidecarCredentials> {
        self.credentials.as_ref()
    }

    pub fn transition(&mut self, next: SidecarState) -> Result<(), SidecarProvisioningError> {
        if !self.state.can_transition_to(next) {
            return Err(SidecarProvisioningError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Final transition: attaches the function binding and credentials.
    pub fn mark_ready(
        &mut self,
        function_id: &str,
        credentials: SidecarCredentials,
    ) -> Result<(), SidecarProvisioningError> {
        self.transition(SidecarState::Ready)?;
        self.function_id = Some(function_id.to_string());
        self.credentials = Some(credentials);
        Ok(())
    }
}

/// A security policy, versioned by HLC stamp.
///
/// The wire form is `{"id", "constraint", "version"}`; the signature is not
/// transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    /// Opaque to the mesh.
    pub constraint: String,
    pub version: Version,
    #[serde(skip)]
    pub signature: Vec<u8>,
}

impl Policy {
    pub fn new(id: impl Into<String>, constraint: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            constraint: constraint.into(),
            version,
            signature: Vec::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}
