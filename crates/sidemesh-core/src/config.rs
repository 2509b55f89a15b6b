//! Mesh configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_FIP_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_NUM_SHARDS, DEFAULT_POLICY_CHANNEL,
    HLC_CLOCK_DRIFT, MAX_CACHE_SKEW, POLICY_CONVERGENCE_TIMEOUT, SIDECAR_BASE_PORT,
};
use crate::error::ConfigError;

pub const ENV_MAX_CACHE_SKEW: &str = "SIDEMESH_MAX_CACHE_SKEW";
pub const ENV_POLICY_CONVERGENCE_TIMEOUT: &str = "SIDEMESH_POLICY_CONVERGENCE_TIMEOUT";
pub const ENV_HLC_CLOCK_DRIFT: &str = "SIDEMESH_HLC_CLOCK_DRIFT";
pub const ENV_CACHE_SHARDS: &str = "SIDEMESH_CACHE_SHARDS";
pub const ENV_FIP_URL: &str = "SIDEMESH_FIP_URL";
pub const ENV_FIP_TIMEOUT: &str = "SIDEMESH_FIP_TIMEOUT";
pub const ENV_HANDSHAKE_TIMEOUT: &str = "SIDEMESH_HANDSHAKE_TIMEOUT";
pub const ENV_CA_CERT: &str = "SIDEMESH_CA_CERT";
pub const ENV_CA_KEY: &str = "SIDEMESH_CA_KEY";
pub const ENV_SIDECAR_BASE_PORT: &str = "SIDEMESH_SIDECAR_BASE_PORT";
pub const ENV_POLICY_CHANNEL: &str = "SIDEMESH_POLICY_CHANNEL";

/// Control plane configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Maximum relative deviation of any cache shard from uniform.
    #[serde(default = "default_max_cache_skew")]
    pub max_cache_skew: f64,

    /// Seconds a node waits for an expected policy version.
    #[serde(default = "default_convergence_timeout")]
    pub policy_convergence_timeout_secs: f64,

    /// HLC drift tolerance in seconds.
    #[serde(default = "default_hlc_drift")]
    pub hlc_clock_drift_secs: f64,

    #[serde(default = "default_num_shards")]
    pub num_shards: usize,

    /// Federated identity provider endpoint.
    #[serde(default)]
    pub fip_url: Option<String>,

    #[serde(default = "default_fip_timeout")]
    pub fip_timeout_secs: f64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: f64,

    /// PEM file holding the mesh CA certificate.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// PEM file holding the mesh CA private key.
    #[serde(default)]
    pub ca_key_path: Option<PathBuf>,

    #[serde(default = "default_base_port")]
    pub sidecar_base_port: u16,

    #[serde(default = "default_policy_channel")]
    pub policy_channel: String,
}

fn default_max_cache_skew() -> f64 {
    MAX_CACHE_SKEW
}

fn default_convergence_timeout() -> f64 {
    POLICY_CONVERGENCE_TIMEOUT.as_secs_f64()
}

fn default_hlc_drift() -> f64 {
    HLC_CLOCK_DRIFT.as_secs_f64()
}

fn default_num_shards() -> usize {
    DEFAULT_NUM_SHARDS
}

fn default_fip_timeout() -> f64 {
    DEFAULT_FIP_TIMEOUT.as_secs_f64()
}

fn default_handshake_timeout() -> f64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs_f64()
}

fn default_base_port() -> u16 {
    SIDECAR_BASE_PORT
}

fn default_policy_channel() -> String {
    DEFAULT_POLICY_CHANNEL.to_string()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_cache_skew: default_max_cache_skew(),
            policy_convergence_timeout_secs: default_convergence_timeout(),
            hlc_clock_drift_secs: default_hlc_drift(),
            num_shards: default_num_shards(),
            fip_url: None,
            fip_timeout_secs: default_fip_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            ca_cert_path: None,
            ca_key_path: None,
            sidecar_base_port: default_base_port(),
            policy_channel: default_policy_channel(),
        }
    }
}

impl MeshConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `SIDEMESH_MAX_CACHE_SKEW` | Allowed shard skew (fraction) |
    /// | `SIDEMESH_POLICY_CONVERGENCE_TIMEOUT` | Seconds |
    /// | `SIDEMESH_HLC_CLOCK_DRIFT` | Seconds |
    /// | `SIDEMESH_CACHE_SHARDS` | Token cache shard count |
    /// | `SIDEMESH_FIP_URL` | Identity provider validation endpoint |
    /// | `SIDEMESH_FIP_TIMEOUT` | Seconds |
    /// | `SIDEMESH_HANDSHAKE_TIMEOUT` | Seconds |
    /// | `SIDEMESH_CA_CERT` / `SIDEMESH_CA_KEY` | CA PEM files |
    /// | `SIDEMESH_SIDECAR_BASE_PORT` | First sidecar port |
    /// | `SIDEMESH_POLICY_CHANNEL` | Pub/sub channel for policies |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but rejects unparseable values.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_lookup(|key| std::env::var(key).ok())
    }

    /// Lenient load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            max_cache_skew: lenient(&get, ENV_MAX_CACHE_SKEW).unwrap_or(d.max_cache_skew),
            policy_convergence_timeout_secs: lenient(&get, ENV_POLICY_CONVERGENCE_TIMEOUT)
                .unwrap_or(d.policy_convergence_timeout_secs),
            hlc_clock_drift_secs: lenient(&get, ENV_HLC_CLOCK_DRIFT)
                .unwrap_or(d.hlc_clock_drift_secs),
            num_shards: lenient(&get, ENV_CACHE_SHARDS).unwrap_or(d.num_shards),
            fip_url: get(ENV_FIP_URL),
            fip_timeout_secs: lenient(&get, ENV_FIP_TIMEOUT).unwrap_or(d.fip_timeout_secs),
            handshake_timeout_secs: lenient(&get, ENV_HANDSHAKE_TIMEOUT)
                .unwrap_or(d.handshake_timeout_secs),
            ca_cert_path: get(ENV_CA_CERT).map(PathBuf::from),
            ca_key_path: get(ENV_CA_KEY).map(PathBuf::from),
            sidecar_base_port: lenient(&get, ENV_SIDECAR_BASE_PORT)
                .unwrap_or(d.sidecar_base_port),
            policy_channel: get(ENV_POLICY_CHANNEL).unwrap_or(d.policy_channel),
        }
    }

    /// Strict load from an arbitrary key lookup.
    pub fn try_from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = strict(&get, ENV_MAX_CACHE_SKEW)? {
            config.max_cache_skew = v;
        }
        if let Some(v) = strict(&get, ENV_POLICY_CONVERGENCE_TIMEOUT)? {
            config.policy_convergence_timeout_secs = v;
        }
        if let Some(v) = strict(&get, ENV_HLC_CLOCK_DRIFT)? {
            config.hlc_clock_drift_secs = v;
        }
        if let Some(v) = strict(&get, ENV_CACHE_SHARDS)? {
            config.num_shards = v;
        }
        if let Some(url) = get(ENV_FIP_URL) {
            url::Url::parse(&url).map_err(|_| invalid(ENV_FIP_URL, &url))?;
            config.fip_url = Some(url);
        }
        if let Some(v) = strict(&get, ENV_FIP_TIMEOUT)? {
            config.fip_timeout_secs = v;
        }
        if let Some(v) = strict(&get, ENV_HANDSHAKE_TIMEOUT)? {
            config.handshake_timeout_secs = v;
        }
        config.ca_cert_path = get(ENV_CA_CERT).map(PathBuf::from);
        config.ca_key_path = get(ENV_CA_KEY).map(PathBuf::from);
        if let Some(v) = strict(&get, ENV_SIDECAR_BASE_PORT)? {
            config.sidecar_base_port = v;
        }
        if let Some(channel) = get(ENV_POLICY_CHANNEL) {
            config.policy_channel = channel;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks ranges that the types alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_shards == 0 {
            return Err(invalid(ENV_CACHE_SHARDS, "0"));
        }
        if !(self.max_cache_skew.is_finite() && self.max_cache_skew >= 0.0) {
            return Err(invalid(ENV_MAX_CACHE_SKEW, &self.max_cache_skew.to_string()));
        }
        for (key, secs) in [
            (ENV_POLICY_CONVERGENCE_TIMEOUT, self.policy_convergence_timeout_secs),
            (ENV_HLC_CLOCK_DRIFT, self.hlc_clock_drift_secs),
            (ENV_FIP_TIMEOUT, self.fip_timeout_secs),
            (ENV_HANDSHAKE_TIMEOUT, self.handshake_timeout_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(invalid(key, &secs.to_string()));
            }
        }
        if self.policy_channel.trim().is_empty() {
            return Err(invalid(ENV_POLICY_CHANNEL, &self.policy_channel));
        }
        Ok(())
    }

    /// Both CA paths, or `ConfigError::Missing` for the first one absent.
    pub fn ca_paths(&self) -> Result<(&PathBuf, &PathBuf), ConfigError> {
        let cert = self.ca_cert_path.as_ref().ok_or_else(|| ConfigError::Missing {
            key: ENV_CA_CERT.to_string(),
        })?;
        let key = self.ca_key_path.as_ref().ok_or_else(|| ConfigError::Missing {
            key: ENV_CA_KEY.to_string(),
        })?;
        Ok((cert, key))
    }

    pub fn policy_convergence_timeout(&self) -> Duration {
        secs_or(self.policy_convergence_timeout_secs, POLICY_CONVERGENCE_TIMEOUT)
    }

    pub fn hlc_clock_drift(&self) -> Duration {
        secs_or(self.hlc_clock_drift_secs, HLC_CLOCK_DRIFT)
    }

    pub fn fip_timeout(&self) -> Duration {
        secs_or(self.fip_timeout_secs, DEFAULT_FIP_TIMEOUT)
    }

    pub fn handshake_timeout(&self) -> Duration {
        secs_or(self.handshake_timeout_secs, DEFAULT_HANDSHAKE_TIMEOUT)
    }

    pub fn with_max_cache_skew(mut self, skew: f64) -> Self {
        self.max_cache_skew = skew;
        self
    }

    pub fn with_num_shards(mut self, num_shards: usize) -> Self {
        self.num_shards = num_shards;
        self
    }

    pub fn with_fip_url(mut self, url: impl Into<String>) -> Self {
        self.fip_url = Some(url.into());
        self
    }

    pub fn with_ca_paths(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(cert.into());
        self.ca_key_path = Some(key.into());
        self
    }

    pub fn with_sidecar_base_port(mut self, port: u16) -> Self {
        self.sidecar_base_port = port;
        self
    }

    pub fn with_policy_channel(mut self, channel: impl Into<String>) -> Self {
        self.policy_channel = channel.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_secs = timeout.as_secs_f64();
        self
    }
}

fn lenient<T, F>(get: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    get(key).and_then(|raw| raw.trim().parse().ok())
}

fn strict<T, F>(get: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &raw)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}
