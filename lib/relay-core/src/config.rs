//! Process-wide proxy configuration
//!
//! Everything here is resolved once at startup and is read-only afterwards.

use crate::{RelayError, Result};
use hyper::Uri;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for a single upstream exchange (connect through response headers)
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// Default time in-flight connections get to finish after shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Charset policy applied to request bodies when they are re-encoded for the target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncodingPolicy {
    /// Re-encode every buffered body as UTF-8, whatever the caller declared
    #[default]
    NormalizeUtf8,
    /// Forward bodies in the charset the caller declared
    Preserve,
}

impl EncodingPolicy {
    pub fn from_flag(preserve: bool) -> Self {
        if preserve {
            EncodingPolicy::Preserve
        } else {
            EncodingPolicy::NormalizeUtf8
        }
    }
}

impl fmt::Display for EncodingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingPolicy::NormalizeUtf8 => write!(f, "NO (UTF-8 used)"),
            EncodingPolicy::Preserve => write!(f, "YES"),
        }
    }
}

/// How the outbound client validates the target's server certificate
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ServerCertPolicy {
    /// Accept any server certificate. Only suitable for local development targets.
    #[default]
    AcceptAny,
    /// Validate against the system roots, or against `ca_file` when given
    Verify { ca_file: Option<PathBuf> },
}

impl fmt::Display for ServerCertPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerCertPolicy::AcceptAny => write!(f, "ACCEPT ANY (verification disabled)"),
            ServerCertPolicy::Verify { ca_file: None } => write!(f, "verify (system roots)"),
            ServerCertPolicy::Verify { ca_file: Some(path) } => {
                write!(f, "verify (CA file {})", path.display())
            }
        }
    }
}

/// Certificate and key used to terminate TLS on the listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerTls {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// URL the proxy listens on (`http://` or `https://`)
    pub listen_url: Uri,
    /// Fixed base URL every request is forwarded to
    pub target_url: Uri,
    /// Subject (or subject fragment) of the client certificate
    pub cert_subject: String,
    pub encoding_policy: EncodingPolicy,
    /// Log request and response bodies. Also selects buffered request handling.
    pub log_body: bool,
    pub server_cert_policy: ServerCertPolicy,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Transaction log file
    pub log_path: PathBuf,
    /// Extra certificate store directories, searched before the default stores
    pub cert_stores: Vec<PathBuf>,
    pub listener_tls: Option<ListenerTls>,
}

impl ProxyConfig {
    /// Build a configuration with defaults for everything but the three required values
    pub fn new(listen_url: &str, target_url: &str, cert_subject: &str) -> Result<Self> {
        let listen_url = parse_http_url(listen_url, "localUrl")?;
        let target_url = parse_http_url(target_url, "targetUrl")?;

        if cert_subject.trim().is_empty() {
            return Err(RelayError::InvalidConfiguration(
                "Invalid certSubject. It cannot be null or empty.".to_string(),
            ));
        }

        Ok(Self {
            listen_url,
            target_url,
            cert_subject: cert_subject.to_string(),
            encoding_policy: EncodingPolicy::default(),
            log_body: true,
            server_cert_policy: ServerCertPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_path: PathBuf::from("proxy.log"),
            cert_stores: Vec::new(),
            listener_tls: None,
        })
    }

    /// Whether the listener terminates TLS
    pub fn listens_https(&self) -> bool {
        self.listen_url.scheme_str() == Some("https")
    }

    /// Resolve the socket address to bind from the listen URL.
    ///
    /// Wildcard hosts (`+`, `*`) bind every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let host = self.listen_url.host().unwrap_or("127.0.0.1");
        let default_port = if self.listens_https() { 443 } else { 80 };
        let port = self.listen_url.port_u16().unwrap_or(default_port);

        let host = match host {
            "+" | "*" => "0.0.0.0",
            h => h.trim_start_matches('[').trim_end_matches(']'),
        };

        (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                RelayError::InvalidConfiguration(format!("Cannot resolve listen address {}: {}", host, e))
            })?
            .next()
            .ok_or_else(|| {
                RelayError::InvalidConfiguration(format!("No address found for {}", host))
            })
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.listens_https() && self.listener_tls.is_none() {
            return Err(RelayError::InvalidConfiguration(
                "An https localUrl needs a listener certificate and key".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(RelayError::InvalidConfiguration(
                "Request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an absolute `http`/`https` URL
pub fn parse_http_url(value: &str, what: &str) -> Result<Uri> {
    let invalid = || {
        RelayError::InvalidConfiguration(format!(
            "Invalid {}. It must be a valid HTTP or HTTPS URL.",
            what
        ))
    };

    let uri: Uri = value.parse().map_err(|_| invalid())?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.host().is_some() => Ok(uri),
        _ => Err(invalid()),
    }
}
