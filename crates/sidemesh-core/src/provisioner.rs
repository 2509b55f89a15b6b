//! Sidecar provisioning workflow.
//!
//! `provision` drives one sidecar through `IDLE -> PROVISIONING -> READY`:
//! reserve a port, issue credentials, deploy, wire networking, install the
//! certificate, then verify the sidecar over mTLS. Any failure after issuance
//! tears the partial deployment down, and the port reservation is released on
//! every failure path, so nothing half-provisioned is ever registered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::constants::SIDECAR_BASE_PORT;
use crate::error::{MtlsError, SidecarProvisioningError};
use crate::model::{Function, Sidecar, SidecarState};
use crate::mtls::{MtlsManager, SidecarCredentials};

/// Container and network operations performed on behalf of the provisioner.
///
/// Every method must be safe to call again during rollback.
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    async fn deploy(&self, sidecar: &Sidecar, function: &Function) -> bool;

    async fn setup_networking(&self, sidecar: &Sidecar, function: &Function) -> bool;

    async fn install_certificates(&self, sidecar: &Sidecar, credentials: &SidecarCredentials)
        -> bool;

    async fn cleanup(&self, sidecar: &Sidecar);
}

/// Issues sidecar identities and verifies running sidecars.
#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Fresh credentials for `identity`, valid for connections to `hosts`.
    async fn issue(
        &self,
        identity: &str,
        hosts: &[String],
    ) -> Result<SidecarCredentials, MtlsError>;

    /// mTLS handshake plus liveness probe against `host:port`.
    async fn verify(
        &self,
        credentials: &SidecarCredentials,
        host: &str,
        port: u16,
    ) -> Result<(), MtlsError>;
}

#[async_trait]
impl CredentialAuthority for MtlsManager {
    async fn issue(
        &self,
        identity: &str,
        hosts: &[String],
    ) -> Result<SidecarCredentials, MtlsError> {
        self.issue_for_hosts(identity, hosts)
    }

    async fn verify(
        &self,
        credentials: &SidecarCredentials,
        host: &str,
        port: u16,
    ) -> Result<(), MtlsError> {
        self.try_handshake(credentials, host, port).await
    }
}

/// Result of a provisioning request that did not fail.
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    Ready(Sidecar),
    /// The function already has a sidecar, or one is being provisioned.
    AlreadyProvisioned,
}

impl ProvisionOutcome {
    pub fn sidecar(&self) -> Option<&Sidecar> {
        match self {
            Self::Ready(sidecar) => Some(sidecar),
            Self::AlreadyProvisioned => None,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    /// Ready sidecars keyed by function id.
    sidecars: BTreeMap<String, Sidecar>,
    /// Ports held by provisions still in progress, keyed by function id.
    in_flight: HashMap<String, u16>,
}

impl Registry {
    fn used_ports(&self) -> BTreeSet<u16> {
        self.sidecars
            .values()
            .map(|s| s.port)
            .chain(self.in_flight.values().copied())
            .collect()
    }
}

/// First port at or above `base` not in `used`.
fn allocate_port(used: &BTreeSet<u16>, base: u16) -> Option<u16> {
    (base..=u16::MAX).find(|port| !used.contains(port))
}

/// Port held for one in-progress provision. Released on drop unless committed.
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    function_id: String,
    port: u16,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, sidecar: Sidecar) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.in_flight.remove(&self.function_id);
        registry.sidecars.insert(self.function_id.clone(), sidecar);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.in_flight.remove(&self.function_id);
        debug!(function_id = %self.function_id, port = self.port, "released port reservation");
    }
}

/// Allocates, deploys and verifies one sidecar per function.
pub struct SidecarProvisioner {
    authority: Arc<dyn CredentialAuthority>,
    backend: Arc<dyn DeploymentBackend>,
    base_port: u16,
    registry: Mutex<Registry>,
}

impl fmt::Debug for SidecarProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidecarProvisioner")
            .field("base_port", &self.base_port)
            .finish_non_exhaustive()
    }
}

impl SidecarProvisioner {
    pub fn new(
        authority: Arc<dyn CredentialAuthority>,
        backend: Arc<dyn DeploymentBackend>,
    ) -> Self {
        Self {
            authority,
            backend,
            base_port: SIDECAR_BASE_PORT,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Provisioner allocating ports from the configured base.
    pub fn from_config(
        config: &MeshConfig,
        authority: Arc<dyn CredentialAuthority>,
        backend: Arc<dyn DeploymentBackend>,
    ) -> Self {
        Self::new(authority, backend).with_base_port(config.sidecar_base_port)
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provisions a sidecar for `function`.
    ///
    /// Concurrent calls for the same function id yield one `Ready` and
    /// `AlreadyProvisioned` for the rest. Failures are logged and returned;
    /// no partial state survives them.
    pub async fn provision(
        &self,
        function: &Function,
    ) -> Result<ProvisionOutcome, SidecarProvisioningError> {
        let result = self.run(function).await;
        if let Err(e) = &result {
            warn!(function_id = %function.id, error = %e, "sidecar provisioning failed");
        }
        result
    }

    async fn run(&self, function: &Function) -> Result<ProvisionOutcome, SidecarProvisioningError> {
        let Some(reservation) = self.reserve(&function.id)? else {
            debug!(function_id = %function.id, "sidecar already provisioned");
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        };

        let mut sidecar = Sidecar::new(
            Sidecar::id_for(&function.id),
            function.node.clone(),
            reservation.port,
        );

        // Nothing deployed yet; dropping the reservation is the whole rollback.
        let credentials = self
            .authority
            .issue(&sidecar.id, std::slice::from_ref(&function.node))
            .await
            .map_err(|source| SidecarProvisioningError::Credentials {
                sidecar_id: sidecar.id.clone(),
                source,
            })?;

        if let Err(e) = self.drive(&mut sidecar, function, &credentials).await {
            self.backend.cleanup(&sidecar).await;
            return Err(e);
        }

        let fingerprint = credentials.fingerprint();
        if let Err(e) = sidecar.mark_ready(&function.id, credentials) {
            self.backend.cleanup(&sidecar).await;
            return Err(e);
        }
        reservation.commit(sidecar.clone());
        info!(
            function_id = %function.id,
            sidecar_id = %sidecar.id,
            node = %sidecar.node,
            port = sidecar.port,
            cert_fingerprint = fingerprint.as_deref().unwrap_or("-"),
            "sidecar ready"
        );
        Ok(ProvisionOutcome::Ready(sidecar))
    }

    fn reserve(&self, function_id: &str) -> Result<Option<Reservation<'_>>, SidecarProvisioningError> {
        let mut registry = self.registry();
        if registry.sidecars.contains_key(function_id) || registry.in_flight.contains_key(function_id)
        {
            return Ok(None);
        }
        let port = allocate_port(&registry.used_ports(), self.base_port).ok_or(
            SidecarProvisioningError::PortsExhausted {
                base: self.base_port,
            },
        )?;
        registry.in_flight.insert(function_id.to_string(), port);
        Ok(Some(Reservation {
            registry: &self.registry,
            function_id: function_id.to_string(),
            port,
            committed: false,
        }))
    }

    async fn drive(
        &self,
        sidecar: &mut Sidecar,
        function: &Function,
        credentials: &SidecarCredentials,
    ) -> Result<(), SidecarProvisioningError> {
        sidecar.transition(SidecarState::Provisioning)?;
        let sidecar_id = || sidecar.id.clone();

        if !self.backend.deploy(sidecar, function).await {
            return Err(SidecarProvisioningError::Deploy {
                sidecar_id: sidecar_id(),
            });
        }
        if !self.backend.setup_networking(sidecar, function).await {
            return Err(SidecarProvisioningError::Networking {
                sidecar_id: sidecar_id(),
            });
        }
        if !self.backend.install_certificates(sidecar, credentials).await {
            return Err(SidecarProvisioningError::CertificateInstall {
                sidecar_id: sidecar_id(),
            });
        }
        self.authority
            .verify(credentials, &sidecar.node, sidecar.port)
            .await
            .map_err(|source| SidecarProvisioningError::Verification {
                sidecar_id: sidecar_id(),
                source,
            })
    }

    /// Ready sidecar serving `function_id`.
    pub fn sidecar_for(&self, function_id: &str) -> Option<Sidecar> {
        self.registry().sidecars.get(function_id).cloned()
    }

    /// Every ready sidecar, by ascending port.
    pub fn sidecars(&self) -> Vec<Sidecar> {
        let mut all: Vec<Sidecar> = self.registry().sidecars.values().cloned().collect();
        all.sort_by_key(|s| s.port);
        all
    }

    /// Ports held by ready sidecars and by provisions in progress.
    pub fn used_ports(&self) -> BTreeSet<u16> {
        self.registry().used_ports()
    }

    /// Port the next provision would receive.
    pub fn next_port(&self) -> Option<u16> {
        allocate_port(&self.used_ports(), self.base_port)
    }

    /// Unregisters the function's sidecar, tears it down and frees its port.
    pub async fn decommission(&self, function_id: &str) -> Option<Sidecar> {
        let sidecar = self.registry().sidecars.remove(function_id)?;
        self.backend.cleanup(&sidecar).await;
        info!(function_id, sidecar_id = %sidecar.id, port = sidecar.port, "sidecar decommissioned");
        Some(sidecar)
    }
}
