//! TLS configuration for both sides of the relay
//!
//! - Outbound: client configuration carrying the client identity and the configured
//!   server-certificate policy.
//! - Inbound: optional TLS termination on the listener.

use crate::mtls::{load_certificates, load_private_key, ClientIdentity};
use anyhow::{anyhow, Result};
use relay_core::{ListenerTls, RelayError, ServerCertPolicy};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Crypto provider used for every TLS configuration built here
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server certificate verifier that accepts every certificate.
///
/// Handshake signatures are still checked, so the peer must hold the key for the
/// certificate it presents, but the certificate itself is never validated.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the outbound TLS configuration: client certificate plus server trust policy
pub fn client_config(
    identity: &ClientIdentity,
    policy: &ServerCertPolicy,
) -> relay_core::Result<ClientConfig> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::Tls(e.to_string()))?;

    let builder = match policy {
        ServerCertPolicy::AcceptAny => {
            warn!("Server certificate verification DISABLED: any certificate presented by the target is accepted");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider)))
        }
        ServerCertPolicy::Verify { ca_file } => {
            let roots = match ca_file {
                Some(path) => {
                    let pem = std::fs::read(path)?;
                    root_store(load_certificates(&pem).map_err(|e| RelayError::Tls(e.to_string()))?)?
                }
                None => root_store(
                    rustls_native_certs::load_native_certs()
                        .map_err(|e| RelayError::Tls(format!("Failed to load system roots: {}", e)))?,
                )?,
            };
            info!("Server certificates verified against {} root(s)", roots.len());
            builder.with_root_certificates(roots)
        }
    };

    builder
        .with_client_auth_cert(identity.cert_chain.clone(), identity.private_key())
        .map_err(|e| RelayError::Tls(format!("Unusable client certificate: {}", e)))
}

fn root_store(certs: Vec<CertificateDer<'static>>) -> relay_core::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!("Root store: {} added, {} ignored", added, ignored);
    if roots.is_empty() {
        return Err(RelayError::Tls("No usable root certificates".to_string()));
    }
    Ok(roots)
}

/// TLS configuration for an HTTPS listener
#[derive(Clone)]
pub struct TlsServerConfig {
    pub config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    /// Create a TLS configuration from PEM-encoded certificate chain and private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        debug!("Creating TLS configuration from PEM data");

        let certs = load_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err(anyhow!("No certificates found in PEM data"));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let private_key =
            load_private_key(key_pem)?.ok_or_else(|| anyhow!("No private key found in PEM data"))?;

        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        info!("TLS listener configuration created");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_files(files: &ListenerTls) -> Result<Self> {
        let cert = std::fs::read(&files.cert_path)
            .map_err(|e| anyhow!("Failed to read {}: {}", files.cert_path.display(), e))?;
        let key = std::fs::read(&files.key_path)
            .map_err(|e| anyhow!("Failed to read {}: {}", files.key_path.display(), e))?;
        Self::from_pem(&cert, &key)
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}
