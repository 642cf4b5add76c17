//! Client identity (certificate + private key) presented to the target during the TLS handshake

use anyhow::{anyhow, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, read_all, Item};
use std::fmt;
use std::io::BufReader;
use tracing::debug;
use x509_parser::parse_x509_certificate;

/// Certificate chain and key used to authenticate to the target.
///
/// Resolved once at startup and shared read-only by every transaction.
pub struct ClientIdentity {
    /// Subject distinguished name of the leaf certificate
    pub subject: String,
    /// Name of the store the certificate was found in
    pub store: String,
    /// Certificate chain, leaf first
    pub cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    pub fn new(
        store: impl Into<String>,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let leaf = cert_chain
            .first()
            .ok_or_else(|| anyhow!("Certificate chain is empty"))?;
        let subject = subject_name(leaf)?;

        Ok(Self {
            subject,
            store: store.into(),
            cert_chain,
            key,
        })
    }

    /// Build an identity from PEM data. The key may live in the certificate PEM itself.
    pub fn from_pem(store: impl Into<String>, cert_pem: &[u8], key_pem: Option<&[u8]>) -> Result<Self> {
        let cert_chain = load_certificates(cert_pem)?;
        if cert_chain.is_empty() {
            return Err(anyhow!("No certificates found in PEM data"));
        }

        let key = match load_private_key(cert_pem)? {
            Some(key) => key,
            None => {
                let key_pem = key_pem.ok_or_else(|| anyhow!("No private key found in PEM data"))?;
                load_private_key(key_pem)?
                    .ok_or_else(|| anyhow!("No private key found in PEM data"))?
            }
        };

        debug!("Client identity loaded with {} certificate(s)", cert_chain.len());
        Self::new(store, cert_chain, key)
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Case-insensitive substring match on the subject name
    pub fn matches_subject(&self, query: &str) -> bool {
        subject_matches(&self.subject, query)
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("subject", &self.subject)
            .field("store", &self.store)
            .field("chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// Load certificates from PEM-encoded data
pub fn load_certificates(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem_data);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))
}

/// Load the first private key from PEM-encoded data, if there is one
pub fn load_private_key(pem_data: &[u8]) -> Result<Option<PrivateKeyDer<'static>>> {
    let mut reader = BufReader::new(pem_data);
    let items: Vec<_> = read_all(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow!("Failed to parse private key: {}", e))?;

    for item in items {
        match item {
            Item::Pkcs8Key(k) => return Ok(Some(PrivateKeyDer::Pkcs8(k))),
            Item::Pkcs1Key(k) => return Ok(Some(PrivateKeyDer::Pkcs1(k))),
            Item::Sec1Key(k) => return Ok(Some(PrivateKeyDer::Sec1(k))),
            _ => {}
        }
    }
    Ok(None)
}

/// Render the subject distinguished name of a DER certificate, e.g. `CN=client, O=Example`
pub fn subject_name(cert: &CertificateDer<'_>) -> Result<String> {
    let (_, parsed) = parse_x509_certificate(cert.as_ref())
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {}", e))?;
    Ok(parsed.subject().to_string())
}

/// Subject lookup is a case-insensitive substring match; no trust-chain validation happens here
pub fn subject_matches(subject: &str, query: &str) -> bool {
    let query = query.trim();
    !query.is_empty() && subject.to_lowercase().contains(&query.to_lowercase())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    /// Self-signed certificate and PKCS#8 key for `common_name`, both PEM
    pub(crate) fn generate_pem(common_name: &str) -> (String, String) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationName, "Relay Test");
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_identity_from_separate_pem() {
        let (cert, key) = generate_pem("test-client");
        let identity = ClientIdentity::from_pem("user", cert.as_bytes(), Some(key.as_bytes())).unwrap();

        assert!(identity.subject.contains("CN=test-client"));
        assert_eq!(identity.store, "user");
        assert_eq!(identity.cert_chain.len(), 1);
        assert!(matches!(identity.private_key(), PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_identity_from_combined_pem() {
        let (cert, key) = generate_pem("combined");
        let combined = format!("{}{}", cert, key);
        let identity = ClientIdentity::from_pem("machine", combined.as_bytes(), None).unwrap();
        assert!(identity.matches_subject("cn=COMBINED"));
    }

    #[test]
    fn test_identity_without_key_fails() {
        let (cert, _) = generate_pem("no-key");
        assert!(ClientIdentity::from_pem("user", cert.as_bytes(), None).is_err());
    }

    #[test]
    fn test_empty_pem_has_no_certificates() {
        assert!(load_certificates(b"").unwrap().is_empty());
        assert!(load_private_key(b"").unwrap().is_none());
    }

    #[test]
    fn test_subject_matching() {
        let subject = "CN=test-client, O=Relay Test";
        assert!(subject_matches(subject, "CN=test-client"));
        assert!(subject_matches(subject, "test-client"));
        assert!(subject_matches(subject, "relay test"));
        assert!(!subject_matches(subject, "CN=other"));
        assert!(!subject_matches(subject, "  "));
    }

    #[test]
    fn test_debug_hides_key() {
        let (cert, key) = generate_pem("debug");
        let identity = ClientIdentity::from_pem("user", cert.as_bytes(), Some(key.as_bytes())).unwrap();
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("CN=debug"));
        assert!(!rendered.contains("PRIVATE"));
    }
}
