//! Policy propagation.
//!
//! Updates are stamped with the node's HLC, persisted under `policy:<id>`
//! and broadcast. Every node merges what it receives with last-writer-wins
//! by version: an incoming policy replaces the local one only when its
//! version is strictly greater. Merges commute and are idempotent, so
//! at-least-once unordered delivery converges on the highest version.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::constants::{DEFAULT_POLICY_CHANNEL, POLICY_CONVERGENCE_TIMEOUT, POLICY_KEY_PREFIX};
use crate::error::PolicyPropagationError;
use crate::hlc::{HybridLogicalClock, SystemClock};
use crate::model::Policy;

/// Buffered messages per subscriber before the slowest one starts lagging.
const BUS_CAPACITY: usize = 256;

/// Durable key-value storage for policy blobs.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<(), PolicyPropagationError>;

    async fn get(&self, key: &str) -> Result<Option<String>, PolicyPropagationError>;

    /// Every `(key, value)` whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, PolicyPropagationError>;
}

/// Pub/sub transport. Delivery is at-least-once and unordered.
#[async_trait]
pub trait PolicyBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PolicyPropagationError>;

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::Receiver<String>, PolicyPropagationError>;
}

/// In-process [`PolicyStore`].
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn put(&self, key: &str, value: String) -> Result<(), PolicyPropagationError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PolicyPropagationError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, PolicyPropagationError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// In-process [`PolicyBus`] fanning out over `tokio::sync::broadcast`.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PolicyBus for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PolicyPropagationError> {
        // No subscribers is not an error on a pub/sub channel.
        let delivered = self.sender(channel).send(payload).unwrap_or(0);
        debug!(channel, delivered, "published policy message");
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::Receiver<String>, PolicyPropagationError> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "policy subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// Converged policy view of one node.
pub struct PolicyManager {
    clock: Arc<HybridLogicalClock>,
    store: Arc<dyn PolicyStore>,
    bus: Arc<dyn PolicyBus>,
    channel: String,
    convergence_timeout: Duration,
    policies: RwLock<HashMap<String, Policy>>,
    changed: Notify,
}

impl fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyManager")
            .field("channel", &self.channel)
            .field("convergence_timeout", &self.convergence_timeout)
            .finish_non_exhaustive()
    }
}

impl PolicyManager {
    pub fn new(store: Arc<dyn PolicyStore>, bus: Arc<dyn PolicyBus>) -> Self {
        Self {
            clock: Arc::new(HybridLogicalClock::new()),
            store,
            bus,
            channel: DEFAULT_POLICY_CHANNEL.to_string(),
            convergence_timeout: POLICY_CONVERGENCE_TIMEOUT,
            policies: RwLock::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn from_config(
        config: &MeshConfig,
        store: Arc<dyn PolicyStore>,
        bus: Arc<dyn PolicyBus>,
    ) -> Self {
        let clock = HybridLogicalClock::with_wall_clock(Arc::new(SystemClock), config.hlc_clock_drift());
        Self::new(store, bus)
            .with_clock(Arc::new(clock))
            .with_channel(config.policy_channel.clone())
            .with_convergence_timeout(config.policy_convergence_timeout())
    }

    pub fn with_clock(mut self, clock: Arc<HybridLogicalClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_convergence_timeout(mut self, timeout: Duration) -> Self {
        self.convergence_timeout = timeout;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn clock(&self) -> &HybridLogicalClock {
        &self.clock
    }

    /// Stamps, persists, applies and broadcasts a new version of `id`.
    pub async fn update(
        &self,
        id: &str,
        constraint: &str,
    ) -> Result<Policy, PolicyPropagationError> {
        let policy = Policy::new(id, constraint, self.clock.now());
        let payload = policy.to_json()?;

        self.store
            .put(&format!("{POLICY_KEY_PREFIX}{id}"), payload.clone())
            .await?;
        self.apply_locally(policy.clone());
        self.bus.publish(&self.channel, payload).await?;

        info!(policy_id = id, version = %policy.version, "policy updated");
        Ok(policy)
    }

    /// Last-writer-wins merge. Returns whether `policy` replaced the local view.
    pub fn apply_locally(&self, policy: Policy) -> bool {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        let newer = policies
            .get(&policy.id)
            .map_or(true, |current| policy.version > current.version);
        if newer {
            debug!(policy_id = %policy.id, version = %policy.version, "applied policy");
            policies.insert(policy.id.clone(), policy);
            drop(policies);
            self.changed.notify_waiters();
        }
        newer
    }

    /// Decodes and merges one broadcast message.
    ///
    /// The remote stamp is fed to the clock first. A stamp too far in the
    /// future is logged and does not move the clock, but the policy is still
    /// merged.
    pub fn receive(&self, payload: &str) -> Result<bool, PolicyPropagationError> {
        let policy = Policy::from_json(payload)?;
        if let Err(e) = self.clock.observe(policy.version) {
            warn!(policy_id = %policy.id, version = %policy.version, error = %e, "remote policy stamp rejected by clock");
        }
        Ok(self.apply_locally(policy))
    }

    /// Subscribes to the policy channel.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<String>, PolicyPropagationError> {
        self.bus.subscribe(&self.channel).await.map_err(|e| match e {
            PolicyPropagationError::Subscribe { .. } => e,
            other => PolicyPropagationError::Subscribe {
                channel: self.channel.clone(),
                message: other.to_string(),
            },
        })
    }

    /// Receive loop. Merges every inbound message until the channel closes.
    pub async fn run(&self, mut inbound: mpsc::Receiver<String>) {
        while let Some(payload) = inbound.recv().await {
            if let Err(e) = self.receive(&payload) {
                warn!(channel = %self.channel, error = %e, "dropping policy message");
            }
        }
        debug!(channel = %self.channel, "policy receive loop finished");
    }

    /// Merges every policy in the durable store. Returns how many were applied.
    pub async fn restore_from_store(&self) -> Result<usize, PolicyPropagationError> {
        let mut applied = 0;
        for (key, blob) in self.store.list(POLICY_KEY_PREFIX).await? {
            match Policy::from_json(&blob) {
                Ok(policy) => {
                    if self.apply_locally(policy) {
                        applied += 1;
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable stored policy"),
            }
        }
        info!(applied, "restored policies from store");
        Ok(applied)
    }

    /// Local version of `policy.id` is at least `policy.version`.
    pub fn verify_consistency(&self, policy: &Policy) -> bool {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&policy.id)
            .is_some_and(|current| current.version >= policy.version)
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Copy of the local view, by ascending version.
    pub fn current_policies(&self) -> Vec<Policy> {
        let mut snapshot: Vec<Policy> = self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        snapshot.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }

    /// Waits until `policy` (or a newer version) is applied locally, for at
    /// most the convergence timeout.
    pub async fn await_convergence(&self, policy: &Policy) -> Result<(), PolicyPropagationError> {
        let deadline = Instant::now() + self.convergence_timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.verify_consistency(policy) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(policy_id = %policy.id, version = %policy.version, "policy did not converge");
                return Err(PolicyPropagationError::ConvergenceTimeout {
                    id: policy.id.clone(),
                    version: policy.version.to_string(),
                    timeout: self.convergence_timeout,
                });
            }
        }
    }
}
