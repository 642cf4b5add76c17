//! Shared fixtures: throwaway PKI, an in-process mTLS upstream and a running relay

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use relay_core::ProxyConfig;
use relay_proxy::mtls::{load_certificates, load_private_key, subject_name};
use relay_proxy::{CertificateResolver, DirectoryStore, Server, Shutdown, StoreScope, TransactionLogger};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub const CLIENT_CN: &str = "relay-client";

pub struct TestPki {
    pub ca_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

/// CA plus a client certificate and a `localhost` server certificate signed by it
pub fn pki() -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.distinguished_name.push(DnType::CommonName, "Relay Test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let client_key = KeyPair::generate().unwrap();
    let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    client_params.distinguished_name.push(DnType::CommonName, CLIENT_CN);
    client_params.distinguished_name.push(DnType::OrganizationName, "Relay Test");
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    server_params.distinguished_name.push(DnType::CommonName, "localhost");
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

    TestPki {
        ca_pem: ca.pem(),
        client_cert_pem: client.pem(),
        client_key_pem: client_key.serialize_pem(),
        server_cert_pem: server.pem(),
        server_key_pem: server_key.serialize_pem(),
    }
}

/// What the upstream saw for one request
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_subject: Option<String>,
}

pub type Handler = Arc<dyn Fn(&SeenRequest) -> Response<Full<Bytes>> + Send + Sync>;

pub struct Upstream {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl Upstream {
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

/// TLS acceptor that requires a client certificate issued by the test CA
fn upstream_acceptor(pki: &TestPki) -> TlsAcceptor {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in load_certificates(pki.ca_pem.as_bytes()).unwrap() {
        roots.add(cert).unwrap();
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .unwrap();

    let chain = load_certificates(pki.server_cert_pem.as_bytes()).unwrap();
    let key = load_private_key(pki.server_key_pem.as_bytes()).unwrap().unwrap();
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// HTTPS upstream that requires a client certificate issued by the test CA
pub async fn start_upstream(pki: &TestPki, handler: Handler) -> Upstream {
    let acceptor = upstream_acceptor(pki);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            let acceptor = acceptor.clone();
            let handler = handler.clone();
            let recorded = recorded.clone();

            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let client_subject = tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(|cert| subject_name(cert).ok());

                let service = service_fn(move |request: Request<Incoming>| {
                    let handler = handler.clone();
                    let recorded = recorded.clone();
                    let client_subject = client_subject.clone();
                    async move {
                        let (parts, body) = request.into_parts();
                        let seen = SeenRequest {
                            method: parts.method.to_string(),
                            uri: parts.uri.to_string(),
                            headers: parts.headers,
                            body: body.collect().await.unwrap().to_bytes(),
                            client_subject,
                        };
                        let response = handler(&seen);
                        recorded.lock().unwrap().push(seen);
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });

    Upstream { addr, seen }
}

/// mTLS upstream that promises `declared_len` body bytes, sends `sent`, then hangs up
pub async fn start_truncating_upstream(
    pki: &TestPki,
    declared_len: usize,
    sent: &'static [u8],
) -> SocketAddr {
    let acceptor = upstream_acceptor(pki);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n",
                    declared_len
                );
                let _ = tls.write_all(head.as_bytes()).await;
                let _ = tls.write_all(sent).await;
                let _ = tls.flush().await;
                let _ = tls.shutdown().await;
            });
        }
    });
    addr
}

/// Upstream that accepts TCP connections and never answers
pub async fn start_silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// A port nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Certificate store directory holding the client identity
pub fn client_store(dir: &Path, pki: &TestPki) -> PathBuf {
    let store = dir.join("certs");
    std::fs::create_dir_all(&store).unwrap();
    std::fs::write(store.join("client.pem"), &pki.client_cert_pem).unwrap();
    std::fs::write(store.join("client.key"), &pki.client_key_pem).unwrap();
    store
}

pub fn config(dir: &Path, target: &str) -> ProxyConfig {
    let mut config = ProxyConfig::new("http://127.0.0.1:0/", target, CLIENT_CN).unwrap();
    config.log_path = dir.join("proxy.log");
    config.request_timeout = Duration::from_secs(10);
    config.shutdown_grace = Duration::from_secs(2);
    config
}

pub struct RunningRelay {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub logger: TransactionLogger,
    pub handle: JoinHandle<relay_core::Result<()>>,
}

impl RunningRelay {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    /// Wait until the log contains `needle`, returning the whole log
    pub async fn wait_for_log(&self, needle: &str) -> String {
        for _ in 0..50 {
            self.logger.flush().await;
            let log = std::fs::read_to_string(self.logger.path()).unwrap_or_default();
            if log.contains(needle) {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("log never contained {:?}", needle);
    }
}

pub async fn start_relay(config: &ProxyConfig, store: &Path) -> RunningRelay {
    let logger = TransactionLogger::open(config.log_path.clone());
    let shutdown = Shutdown::new();
    let resolver = CertificateResolver::new().add(DirectoryStore::new(StoreScope::User, store));

    let server = Server::start(config, &resolver, logger.clone(), shutdown.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());

    RunningRelay {
        addr,
        shutdown,
        logger,
        handle,
    }
}

pub type TestClient = hyper_util::client::legacy::Client<
    hyper_util::client::legacy::connect::HttpConnector,
    Full<Bytes>,
>;

pub fn client() -> TestClient {
    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build_http()
}

pub async fn read_body(response: Response<Incoming>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}
