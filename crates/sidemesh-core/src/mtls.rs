//! Mesh certificate authority and mTLS handshakes.
//!
//! The CA certificate and key are provisioned out of band and loaded once at
//! startup. Every sidecar gets a fresh key pair and a certificate signed by
//! the CA through a CSR bound to the sidecar identity. Handshakes present
//! those credentials, verify the peer against the CA with hostname
//! verification, and finish with a `VERIFY` / `OK` liveness probe.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use rcgen::{
    string::Ia5String, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::MeshConfig;
use crate::constants::{CERT_VALIDITY_DAYS, DEFAULT_HANDSHAKE_TIMEOUT, VERIFY_ACK, VERIFY_PROBE};
use crate::error::{MtlsError, SidemeshError};
use crate::hashing::sha256_hex;

/// Largest probe or acknowledgement either side reads.
const PROBE_READ_LIMIT: usize = 100;

/// Certificate and private key issued to one sidecar identity.
#[derive(Clone, PartialEq, Eq)]
pub struct SidecarCredentials {
    identity: String,
    certificate_pem: String,
    private_key_pem: String,
}

impl fmt::Debug for SidecarCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidecarCredentials")
            .field("identity", &self.identity)
            .field("private_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl SidecarCredentials {
    pub fn new(
        identity: impl Into<String>,
        certificate_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            certificate_pem: certificate_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Hex SHA-256 of the leaf certificate's DER encoding, if it parses.
    pub fn fingerprint(&self) -> Option<String> {
        CertificateDer::from_pem_slice(self.certificate_pem.as_bytes())
            .ok()
            .map(|der| sha256_hex(&der))
    }

    /// DER certificate chain and key for rustls.
    pub fn to_der(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), MtlsError> {
        let chain = CertificateDer::pem_slice_iter(self.certificate_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MtlsError::Pem(format!("sidecar certificate: {e}")))?;
        if chain.is_empty() {
            return Err(MtlsError::Pem("sidecar certificate: no PEM block".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(self.private_key_pem.as_bytes())
            .map_err(|e| MtlsError::Pem(format!("sidecar key: {e}")))?;
        Ok((chain, key))
    }
}

/// Certificate authority and mTLS client for the mesh.
pub struct MtlsManager {
    ca_cert_pem: String,
    /// Kept as PEM; `KeyPair` is reloaded per signature.
    ca_key_pem: String,
    ca_cert_der: CertificateDer<'static>,
    handshake_timeout: Duration,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for MtlsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsManager")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl MtlsManager {
    /// Loads the CA from PEM files. Failure here is a fatal configuration error.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, MtlsError> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref())?;
        let key_pem = std::fs::read_to_string(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Loads the CA named by `SIDEMESH_CA_CERT` / `SIDEMESH_CA_KEY` and applies
    /// the configured handshake timeout.
    pub fn from_config(config: &MeshConfig) -> Result<Self, SidemeshError> {
        let (cert_path, key_path) = config.ca_paths()?;
        let manager = Self::from_pem_files(cert_path, key_path)?;
        Ok(manager.with_handshake_timeout(config.handshake_timeout()))
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, MtlsError> {
        let ca_cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| MtlsError::Pem(format!("CA certificate: {e}")))?;
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| MtlsError::Pem(format!("CA key: {e}")))?;
        // Fails when the key does not belong to the certificate's algorithm
        Issuer::from_ca_cert_pem(cert_pem, &ca_key)
            .map_err(|e| MtlsError::Pem(format!("CA issuer: {e}")))?;

        Ok(Self {
            ca_cert_pem: cert_pem.to_string(),
            ca_key_pem: key_pem.to_string(),
            ca_cert_der,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// CA certificate for distribution to sidecars.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issues credentials whose subject common name is `identity`.
    pub fn issue(&self, identity: &str) -> Result<SidecarCredentials, MtlsError> {
        self.issue_for_hosts(identity, &[])
    }

    /// Issues credentials that additionally name `hosts` as subject
    /// alternative names, so that peers dialing those hosts pass hostname
    /// verification.
    pub fn issue_for_hosts(
        &self,
        identity: &str,
        hosts: &[String],
    ) -> Result<SidecarCredentials, MtlsError> {
        let key_pair = KeyPair::generate().map_err(|e| MtlsError::KeyGeneration(e.to_string()))?;

        let mut request = CertificateParams::default();
        request.distinguished_name = subject(identity);
        let csr_pem = request
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| MtlsError::Certificate(format!("failed to build CSR: {e}")))?;

        let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| MtlsError::Certificate(format!("failed to parse CSR: {e}")))?;

        let now = OffsetDateTime::now_utc();
        csr.params.distinguished_name = subject(identity);
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        csr.params.not_before = now;
        csr.params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);
        csr.params.serial_number = Some(random_serial());
        csr.params.subject_alt_names = subject_alt_names(identity, hosts)?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| MtlsError::Pem(format!("CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| MtlsError::Pem(format!("CA issuer: {e}")))?;
        let cert = csr
            .signed_by(&issuer)
            .map_err(|e| MtlsError::Certificate(format!("failed to sign certificate: {e}")))?;

        debug!(identity, fingerprint = %sha256_hex(cert.der()), "issued sidecar certificate");
        Ok(SidecarCredentials::new(
            identity,
            cert.pem(),
            key_pair.serialize_pem(),
        ))
    }

    fn roots(&self) -> Result<RootCertStore, MtlsError> {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert_der.clone())?;
        Ok(roots)
    }

    /// Client side: presents `credentials`, trusts only the mesh CA.
    pub fn client_config(
        &self,
        credentials: &SidecarCredentials,
    ) -> Result<Arc<ClientConfig>, MtlsError> {
        let (chain, key) = credentials.to_der()?;
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.roots()?)
            .with_client_auth_cert(chain, key)?;
        Ok(Arc::new(config))
    }

    /// Sidecar side: presents `credentials` and requires a client
    /// certificate issued by the mesh CA.
    pub fn server_config(
        &self,
        credentials: &SidecarCredentials,
    ) -> Result<Arc<ServerConfig>, MtlsError> {
        let (chain, key) = credentials.to_der()?;
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.roots()?), self.provider.clone())
                .build()
                .map_err(|e| MtlsError::Tls(e.to_string()))?;
        let config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;
        Ok(Arc::new(config))
    }

    /// Connects to `host:port`, completes the mutual TLS handshake and the
    /// liveness probe, all within the handshake timeout.
    pub async fn try_handshake(
        &self,
        credentials: &SidecarCredentials,
        host: &str,
        port: u16,
    ) -> Result<(), MtlsError> {
        let connector = TlsConnector::from(self.client_config(credentials)?);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| MtlsError::InvalidHost(host.to_string()))?;

        let exchange = async {
            let tcp = TcpStream::connect((host, port)).await?;
            let mut tls = connector.connect(server_name, tcp).await?;
            tls.write_all(VERIFY_PROBE).await?;
            tls.flush().await?;

            let received = read_expected(&mut tls, VERIFY_ACK).await?;
            // Best effort close_notify; the verdict is already known.
            let _ = tls.shutdown().await;

            if received == VERIFY_ACK {
                Ok(())
            } else {
                Err(MtlsError::Probe {
                    received: String::from_utf8_lossy(&received).into_owned(),
                })
            }
        };

        tokio::time::timeout(self.handshake_timeout, exchange)
            .await
            .map_err(|_| MtlsError::Timeout(self.handshake_timeout))?
    }

    /// `true` when the handshake and liveness probe both succeed.
    pub async fn handshake(&self, credentials: &SidecarCredentials, host: &str, port: u16) -> bool {
        match self.try_handshake(credentials, host, port).await {
            Ok(()) => true,
            Err(e) => {
                debug!(identity = credentials.identity(), host, port, error = %e, "mTLS handshake failed");
                false
            }
        }
    }
}

/// Sidecar half of the liveness probe: answers `VERIFY` with `OK`.
pub async fn answer_probe<S>(stream: &mut S) -> Result<(), MtlsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let received = read_expected(stream, VERIFY_PROBE).await?;
    if received != VERIFY_PROBE {
        return Err(MtlsError::Probe {
            received: String::from_utf8_lossy(&received).into_owned(),
        });
    }
    stream.write_all(VERIFY_ACK).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads up to `expected.len()` bytes, however the peer fragments them.
///
/// Stops early at EOF or as soon as the bytes stop matching `expected`.
async fn read_expected<S>(stream: &mut S, expected: &[u8]) -> Result<Vec<u8>, MtlsError>
where
    S: AsyncRead + Unpin,
{
    let want = expected.len().min(PROBE_READ_LIMIT);
    let mut received = Vec::with_capacity(want);
    let mut buf = [0u8; PROBE_READ_LIMIT];
    while received.len() < want {
        let n = stream.read(&mut buf[..want - received.len()]).await?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
        if !expected.starts_with(&received) {
            break;
        }
    }
    Ok(received)
}

fn subject(identity: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(identity.to_string()));
    dn
}

fn subject_alt_names(identity: &str, hosts: &[String]) -> Result<Vec<SanType>, MtlsError> {
    let mut names = Vec::with_capacity(hosts.len() + 1);
    for name in std::iter::once(identity).chain(hosts.iter().map(String::as_str)) {
        let san = match name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                Ia5String::try_from(name.to_string())
                    .map_err(|_| MtlsError::InvalidHost(name.to_string()))?,
            ),
        };
        if !names.contains(&san) {
            names.push(san);
        }
    }
    Ok(names)
}

/// 127 random bits; the top bit is cleared so the DER integer stays positive.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}
