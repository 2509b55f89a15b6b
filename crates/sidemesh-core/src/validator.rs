//! Cluster-level token validation.
//!
//! A token id is routed to one cache node by `sha256(id) mod N` over an
//! ordered node list. This is independent of the shard function inside each
//! node's [`TokenCache`]. On a node miss the federated identity provider is
//! asked; a positive answer is cached on the routed node for the token's TTL.
//! Every failure path answers `false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::cache::TokenCache;
use crate::config::{MeshConfig, ENV_FIP_URL};
use crate::error::{ConfigError, SidemeshError, TokenValidationError};
use crate::hashing::sha256_mod;
use crate::model::Token;

/// One cache endpoint in the validation cluster.
#[async_trait]
pub trait CacheNode: Send + Sync {
    /// Fresh entry present for `token.id`.
    async fn contains(&self, token: &Token) -> bool;

    /// Caches a remotely validated token for `ttl`.
    async fn add(&self, token: &Token, ttl: Duration);
}

#[async_trait]
impl CacheNode for TokenCache {
    async fn contains(&self, token: &Token) -> bool {
        TokenCache::contains(self, token)
    }

    async fn add(&self, token: &Token, ttl: Duration) {
        self.insert(token, ttl);
    }
}

/// Remote authority for tokens the cluster has not seen.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn validate_remote(&self, token_id: &str) -> Result<bool, TokenValidationError>;
}

#[derive(Debug, Serialize)]
struct FipRequest<'a> {
    token_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct FipResponse {
    #[serde(default)]
    valid: bool,
}

/// HTTP client for the federated identity provider.
#[derive(Debug, Clone)]
pub struct FipClient {
    client: Client,
    endpoint: Url,
}

impl FipClient {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, TokenValidationError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sidemesh/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn from_config(config: &MeshConfig) -> Result<Self, SidemeshError> {
        let raw = config.fip_url.as_deref().ok_or_else(|| ConfigError::Missing {
            key: ENV_FIP_URL.to_string(),
        })?;
        let endpoint = Url::parse(raw).map_err(|_| ConfigError::InvalidValue {
            key: ENV_FIP_URL.to_string(),
            value: raw.to_string(),
        })?;
        Ok(Self::new(endpoint, config.fip_timeout())?)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl IdentityProvider for FipClient {
    async fn validate_remote(&self, token_id: &str) -> Result<bool, TokenValidationError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&FipRequest { token_id })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TokenValidationError::Remote {
                status: status.as_u16(),
            });
        }

        let body: FipResponse = response.json().await?;
        Ok(body.valid)
    }
}

/// Routes tokens to cache nodes and falls back to the identity provider.
pub struct TokenValidator {
    nodes: Vec<Arc<dyn CacheNode>>,
    fip: Arc<dyn IdentityProvider>,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    pub fn new(
        nodes: Vec<Arc<dyn CacheNode>>,
        fip: Arc<dyn IdentityProvider>,
    ) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::Missing {
                key: "cache_nodes".to_string(),
            });
        }
        Ok(Self { nodes, fip })
    }

    /// Index of the node responsible for `token_id`.
    pub fn node_index(&self, token_id: &str) -> usize {
        sha256_mod(token_id, self.nodes.len())
    }

    pub async fn validate(&self, token: &Token) -> bool {
        let index = self.node_index(&token.id);
        let node = &self.nodes[index];

        if node.contains(token).await {
            return true;
        }

        match self.fip.validate_remote(&token.id).await {
            Ok(true) => {
                node.add(token, Duration::from_secs(token.ttl)).await;
                debug!(token_id = %token.id, node = index, "token validated remotely");
                true
            }
            Ok(false) => {
                debug!(token_id = %token.id, "identity provider rejected token");
                false
            }
            Err(e) => {
                warn!(token_id = %token.id, error = %e, retryable = e.is_retryable(), "remote validation failed");
                false
            }
        }
    }
}
