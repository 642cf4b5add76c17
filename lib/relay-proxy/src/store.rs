//! Certificate stores and subject lookup for the client identity

use crate::mtls::ClientIdentity;
use anyhow::Result;
use relay_core::RelayError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a store lives. User stores are searched before machine stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreScope {
    User,
    Machine,
}

impl fmt::Display for StoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreScope::User => write!(f, "user"),
            StoreScope::Machine => write!(f, "machine"),
        }
    }
}

/// A read-only source of client certificates
#[async_trait::async_trait]
pub trait CertificateStore: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> StoreScope;

    /// Return the first certificate with a private key whose subject matches `subject`
    async fn find_by_subject(&self, subject: &str) -> Result<Option<ClientIdentity>>;
}

/// Store backed by a directory of PEM files.
///
/// Every `*.pem`, `*.crt` or `*.cer` file is a candidate. Its private key is taken from the
/// same file, or from a sibling file with the same stem and a `.key` extension.
pub struct DirectoryStore {
    name: String,
    scope: StoreScope,
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(scope: StoreScope, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            name: format!("{}:{}", scope, dir.display()),
            scope,
            dir,
        }
    }

    fn is_certificate_file(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
            Some("pem") | Some("crt") | Some("cer")
        )
    }

    async fn load_candidate(&self, path: &Path) -> Result<ClientIdentity> {
        let cert_pem = tokio::fs::read(path).await?;
        let key_path = path.with_extension("key");
        let key_pem = match tokio::fs::read(&key_path).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        ClientIdentity::from_pem(self.name.clone(), &cert_pem, key_pem.as_deref())
    }
}

#[async_trait::async_trait]
impl CertificateStore for DirectoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> StoreScope {
        self.scope
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<ClientIdentity>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if Self::is_certificate_file(&path) {
                candidates.push(path);
            }
        }
        // Directory order is platform dependent
        candidates.sort();

        for path in candidates {
            match self.load_candidate(&path).await {
                Ok(identity) if identity.matches_subject(subject) => {
                    debug!("Matched {} in {}", identity.subject, path.display());
                    return Ok(Some(identity));
                }
                Ok(identity) => {
                    debug!("Skipping {} ({})", path.display(), identity.subject);
                }
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                }
            }
        }
        Ok(None)
    }
}

/// Searches certificate stores in priority order for the client identity
pub struct CertificateResolver {
    stores: Vec<Arc<dyn CertificateStore>>,
}

impl CertificateResolver {
    pub fn new() -> Self {
        Self { stores: Vec::new() }
    }

    /// Add a store. Within a scope, stores are searched in the order they were added.
    pub fn add<S: CertificateStore + 'static>(mut self, store: S) -> Self {
        self.stores.push(Arc::new(store));
        self
    }

    /// Default stores for `program`: `$HOME/.local/share/<program>/certs`, then `/etc/<program>/certs`
    pub fn with_default_stores(self, program: &str) -> Self {
        let resolver = match std::env::var_os("HOME") {
            Some(home) => self.add(DirectoryStore::new(
                StoreScope::User,
                PathBuf::from(home).join(".local/share").join(program).join("certs"),
            )),
            None => self,
        };
        resolver.add(DirectoryStore::new(
            StoreScope::Machine,
            PathBuf::from("/etc").join(program).join("certs"),
        ))
    }

    /// Stores in search order
    pub fn stores(&self) -> Vec<&dyn CertificateStore> {
        let mut ordered: Vec<&dyn CertificateStore> = self.stores.iter().map(|s| s.as_ref()).collect();
        // Stable sort keeps insertion order within a scope
        ordered.sort_by_key(|s| s.scope());
        ordered
    }

    /// Find the client identity for `subject`.
    ///
    /// A store that cannot be read is logged and skipped; the search only fails when no
    /// store has a match.
    pub async fn resolve(&self, subject: &str) -> relay_core::Result<ClientIdentity> {
        for store in self.stores() {
            match store.find_by_subject(subject).await {
                Ok(Some(identity)) => {
                    info!("Certificate found in {} store: {}", store.name(), identity.subject);
                    return Ok(identity);
                }
                Ok(None) => debug!("No certificate matching {} in {}", subject, store.name()),
                Err(e) => warn!("Certificate store {} unavailable: {}", store.name(), e),
            }
        }
        Err(RelayError::CertificateNotFound(subject.to_string()))
    }
}

impl Default for CertificateResolver {
    fn default() -> Self {
        Self::new()
    }
}
