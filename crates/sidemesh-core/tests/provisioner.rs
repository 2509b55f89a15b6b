//! Integration tests for SidecarProvisioner with scripted collaborators.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sidemesh_core::{
    CredentialAuthority, DeploymentBackend, Function, MeshConfig, MtlsError, ProvisionOutcome, Sidecar,
    SidecarCredentials, SidecarProvisioner, SidecarProvisioningError, SidecarState,
};

#[derive(Default)]
struct ScriptedBackend {
    fail_deploy: AtomicBool,
    fail_networking: AtomicBool,
    fail_install: AtomicBool,
    steps: Mutex<Vec<String>>,
    cleanups: AtomicUsize,
}

impl ScriptedBackend {
    fn record(&self, step: &str, sidecar: &Sidecar) {
        self.steps
            .lock()
            .unwrap()
            .push(format!("{step}:{}:{}", sidecar.id, sidecar.state()));
    }

    fn steps(&self) -> Vec<String> {
        self.steps.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeploymentBackend for ScriptedBackend {
    async fn deploy(&self, sidecar: &Sidecar, _function: &Function) -> bool {
        // Yield so concurrent provisions genuinely interleave.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.record("deploy", sidecar);
        !self.fail_deploy.load(Ordering::SeqCst)
    }

    async fn setup_networking(&self, sidecar: &Sidecar, _function: &Function) -> bool {
        self.record("network", sidecar);
        !self.fail_networking.load(Ordering::SeqCst)
    }

    async fn install_certificates(
        &self,
        sidecar: &Sidecar,
        credentials: &SidecarCredentials,
    ) -> bool {
        assert_eq!(credentials.identity(), sidecar.id);
        self.record("install", sidecar);
        !self.fail_install.load(Ordering::SeqCst)
    }

    async fn cleanup(&self, sidecar: &Sidecar) {
        self.record("cleanup", sidecar);
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeAuthority {
    fail_issue: AtomicBool,
    fail_verify: AtomicBool,
    issued: AtomicUsize,
}

#[async_trait]
impl CredentialAuthority for FakeAuthority {
    async fn issue(
        &self,
        identity: &str,
        hosts: &[String],
    ) -> Result<SidecarCredentials, MtlsError> {
        if self.fail_issue.load(Ordering::SeqCst) {
            return Err(MtlsError::KeyGeneration("entropy pool empty".into()));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(SidecarCredentials::new(
            identity,
            format!("CERT-{n}-{}", hosts.join(",")),
            format!("KEY-{n}"),
        ))
    }

    async fn verify(
        &self,
        _credentials: &SidecarCredentials,
        _host: &str,
        _port: u16,
    ) -> Result<(), MtlsError> {
        if self.fail_verify.load(Ordering::SeqCst) {
            Err(MtlsError::Probe {
                received: "NO".into(),
            })
        } else {
            Ok(())
        }
    }
}

fn setup() -> (Arc<FakeAuthority>, Arc<ScriptedBackend>, SidecarProvisioner) {
    let authority = Arc::new(FakeAuthority::default());
    let backend = Arc::new(ScriptedBackend::default());
    let provisioner = SidecarProvisioner::new(authority.clone(), backend.clone());
    (authority, backend, provisioner)
}

fn function(id: &str) -> Function {
    Function::new(id, "node-a").with_namespace("payments")
}

fn ready(outcome: ProvisionOutcome) -> Sidecar {
    match outcome {
        ProvisionOutcome::Ready(sidecar) => sidecar,
        ProvisionOutcome::AlreadyProvisioned => panic!("expected a new sidecar"),
    }
}

#[tokio::test]
async fn test_happy_path_reaches_ready() {
    common::init_tracing();
    let (_, backend, provisioner) = setup();

    let sidecar = ready(provisioner.provision(&function("f1")).await.unwrap());
    assert_eq!(sidecar.id, "sidecar-f1");
    assert_eq!(sidecar.state(), SidecarState::Ready);
    assert_eq!(sidecar.port, 8000);
    assert_eq!(sidecar.function_id(), Some("f1"));
    assert_eq!(sidecar.cert_pem(), Some("CERT-0-node-a"));
    assert_eq!(sidecar.private_key_pem(), Some("KEY-0"));

    assert_eq!(
        backend.steps(),
        [
            "deploy:sidecar-f1:PROVISIONING",
            "network:sidecar-f1:PROVISIONING",
            "install:sidecar-f1:PROVISIONING",
        ]
    );
    assert_eq!(provisioner.sidecar_for("f1").unwrap().port, 8000);
}

#[tokio::test]
async fn test_second_provision_is_a_no_op() {
    let (authority, _, provisioner) = setup();
    ready(provisioner.provision(&function("f1")).await.unwrap());

    let again = provisioner.provision(&function("f1")).await.unwrap();
    assert!(matches!(again, ProvisionOutcome::AlreadyProvisioned));
    assert_eq!(authority.issued.load(Ordering::SeqCst), 1);
    assert_eq!(provisioner.sidecars().len(), 1);
}

#[tokio::test]
async fn test_concurrent_provisions_yield_one_sidecar() {
    let (authority, _, provisioner) = setup();
    let f = function("f-race");

    let (a, b) = tokio::join!(provisioner.provision(&f), provisioner.provision(&f));
    let outcomes = [a.unwrap(), b.unwrap()];

    let readies = outcomes.iter().filter_map(ProvisionOutcome::sidecar).count();
    assert_eq!(readies, 1);
    assert_eq!(authority.issued.load(Ordering::SeqCst), 1);
    assert_eq!(provisioner.sidecars().len(), 1);
}

#[tokio::test]
async fn test_networking_failure_leaves_nothing_behind() {
    let (_, backend, provisioner) = setup();
    backend.fail_networking.store(true, Ordering::SeqCst);

    let err = provisioner.provision(&function("f1")).await.unwrap_err();
    assert!(matches!(err, SidecarProvisioningError::Networking { .. }));
    assert_eq!(err.sidecar_id(), Some("sidecar-f1"));

    assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1);
    assert!(provisioner.sidecars().is_empty());
    assert!(provisioner.used_ports().is_empty());
    assert_eq!(provisioner.next_port(), Some(8000));
    assert!(provisioner.sidecar_for("f1").is_none());
}

#[tokio::test]
async fn test_every_step_failure_cleans_up() {
    for step in ["deploy", "install", "verify"] {
        let (authority, backend, provisioner) = setup();
        match step {
            "deploy" => backend.fail_deploy.store(true, Ordering::SeqCst),
            "install" => backend.fail_install.store(true, Ordering::SeqCst),
            _ => authority.fail_verify.store(true, Ordering::SeqCst),
        }

        let err = provisioner.provision(&function("f1")).await.unwrap_err();
        match step {
            "deploy" => assert!(matches!(err, SidecarProvisioningError::Deploy { .. })),
            "install" => {
                assert!(matches!(err, SidecarProvisioningError::CertificateInstall { .. }))
            }
            _ => assert!(matches!(err, SidecarProvisioningError::Verification { .. })),
        }
        assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1, "{step}");
        assert!(provisioner.used_ports().is_empty(), "{step}");
    }
}

#[tokio::test]
async fn test_issue_failure_has_nothing_to_clean_up() {
    let (authority, backend, provisioner) = setup();
    authority.fail_issue.store(true, Ordering::SeqCst);

    let err = provisioner.provision(&function("f1")).await.unwrap_err();
    assert!(matches!(err, SidecarProvisioningError::Credentials { .. }));
    assert_eq!(backend.cleanups.load(Ordering::SeqCst), 0);
    assert!(backend.steps().is_empty());
    assert!(provisioner.used_ports().is_empty());

    // The function can be provisioned once the authority recovers.
    authority.fail_issue.store(false, Ordering::SeqCst);
    ready(provisioner.provision(&function("f1")).await.unwrap());
}

#[tokio::test]
async fn test_ports_are_allocated_upward() {
    let (_, _, provisioner) = setup();
    let a = ready(provisioner.provision(&function("f-a")).await.unwrap());
    let b = ready(provisioner.provision(&function("f-b")).await.unwrap());
    assert_eq!((a.port, b.port), (8000, 8001));

    assert_eq!(provisioner.next_port(), Some(8002));
    let c = ready(provisioner.provision(&function("f-c")).await.unwrap());
    assert_eq!(c.port, 8002);
}

#[tokio::test]
async fn test_decommission_frees_the_port() {
    let (_, backend, provisioner) = setup();
    ready(provisioner.provision(&function("f-a")).await.unwrap());
    ready(provisioner.provision(&function("f-b")).await.unwrap());

    let removed = provisioner.decommission("f-a").await.unwrap();
    assert_eq!(removed.port, 8000);
    assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1);
    assert!(provisioner.decommission("f-a").await.is_none());

    let c = ready(provisioner.provision(&function("f-c")).await.unwrap());
    assert_eq!(c.port, 8000);
}

#[tokio::test]
async fn test_provisioner_from_config_uses_base_port() {
    let config = MeshConfig::default().with_sidecar_base_port(9300);
    let provisioner = SidecarProvisioner::from_config(
        &config,
        Arc::new(FakeAuthority::default()),
        Arc::new(ScriptedBackend::default()),
    );
    assert_eq!(provisioner.next_port(), Some(9300));

    let sidecar = ready(provisioner.provision(&function("f1")).await.unwrap());
    assert_eq!(sidecar.port, 9300);
    assert_eq!(provisioner.next_port(), Some(9301));
}

#[tokio::test]
async fn test_function_ids_stay_unique() {
    let (_, _, provisioner) = setup();
    let provisioner = provisioner.with_base_port(9100);
    let ids: Vec<String> = (0..5).map(|_| uuid::Uuid::new_v4().to_string()).collect();
    for id in &ids {
        ready(provisioner.provision(&function(id)).await.unwrap());
    }

    let sidecars = provisioner.sidecars();
    assert_eq!(sidecars.len(), ids.len());
    let ports: Vec<u16> = sidecars.iter().map(|s| s.port).collect();
    assert_eq!(ports, (9100..9105).collect::<Vec<_>>());
    let mut bound: Vec<&str> = sidecars.iter().filter_map(Sidecar::function_id).collect();
    bound.sort_unstable();
    bound.dedup();
    assert_eq!(bound.len(), ids.len());
}
