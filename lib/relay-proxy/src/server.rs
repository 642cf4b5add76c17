//! Listener and accept loop
//!
//! One task per connection, tracked in a `JoinSet`. On shutdown the listener is dropped
//! before `run` returns, open connections are asked to finish gracefully and anything
//! still running after the grace period is aborted.

use crate::client::OutboundClient;
use crate::http::ForwardingProxy;
use crate::logger::{LogEvent, TransactionLogger};
use crate::shutdown::Shutdown;
use crate::store::CertificateResolver;
use crate::tls::TlsServerConfig;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use relay_core::{ProxyConfig, RelayError};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub struct Server {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    proxy: Arc<ForwardingProxy>,
    shutdown: Shutdown,
    grace: Duration,
}

impl Server {
    /// Resolve the client certificate, build the outbound client and bind the listener.
    ///
    /// The certificate is resolved first: when it cannot be found nothing is bound.
    pub async fn start(
        config: &ProxyConfig,
        resolver: &CertificateResolver,
        logger: TransactionLogger,
        shutdown: Shutdown,
    ) -> relay_core::Result<Self> {
        config.validate()?;
        log_startup(config, &logger);

        let identity = match resolver.resolve(&config.cert_subject).await {
            Ok(identity) => identity,
            Err(e) => {
                logger.record(LogEvent::Startup(&format!("[ERROR] {}", e)));
                return Err(e);
            }
        };
        logger.record(LogEvent::Startup(&format!(
            "[OK] Certificate found: {} (store {})",
            identity.subject, identity.store
        )));

        let client = OutboundClient::new(&identity, &config.server_cert_policy, config.request_timeout)?;

        let acceptor = match &config.listener_tls {
            Some(files) if config.listens_https() => Some(
                TlsServerConfig::from_files(files)
                    .map_err(|e| RelayError::Tls(e.to_string()))?
                    .acceptor(),
            ),
            _ => None,
        };

        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        logger.record(LogEvent::Startup(&format!(
            "[OK] Listener started on {} ({})",
            local,
            if acceptor.is_some() { "https" } else { "http" }
        )));

        let proxy = Arc::new(ForwardingProxy::new(config, client, logger));
        Ok(Self {
            listener,
            acceptor,
            proxy,
            shutdown,
            grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, then drain them
    pub async fn run(self) -> relay_core::Result<()> {
        let Server {
            listener,
            acceptor,
            proxy,
            shutdown,
            grace,
        } = self;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let proxy = proxy.clone();
                        let shutdown = shutdown.clone();
                        match acceptor.clone() {
                            Some(acceptor) => {
                                connections.spawn(async move {
                                    match acceptor.accept(stream).await {
                                        Ok(tls) => serve_connection(tls, peer, proxy, shutdown).await,
                                        Err(e) => debug!("TLS error from {}: {}", peer, e),
                                    }
                                });
                            }
                            None => {
                                connections.spawn(serve_connection(stream, peer, proxy, shutdown));
                            }
                        }
                    }
                    Err(e) => warn!("Error accepting connection: {}", e),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        proxy
            .logger()
            .record(LogEvent::Startup("[INFO] Listener stopped."));

        let open = connections.len();
        if open > 0 {
            info!("Waiting up to {:?} for {} connection(s)", grace, open);
            let drained = tokio::time::timeout(grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Aborting {} connection(s) after grace period", connections.len());
                connections.shutdown().await;
            }
        }

        proxy.logger().flush().await;
        Ok(())
    }
}

async fn serve_connection<S>(io: S, peer: SocketAddr, proxy: Arc<ForwardingProxy>, shutdown: Shutdown)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = {
        let shutdown = shutdown.clone();
        service_fn(move |request: Request<Incoming>| {
            let proxy = proxy.clone();
            let shutdown = shutdown.clone();
            async move { Ok::<_, Infallible>(proxy.handle(request, &shutdown).await) }
        })
    };

    let connection = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        debug!("Error serving connection from {}: {}", peer, e);
    }
}

fn log_startup(config: &ProxyConfig, logger: &TransactionLogger) {
    let lines = [
        "Starting HTTP proxy...".to_string(),
        format!("Listen on: {}", config.listen_url),
        format!("Forward to: {}", config.target_url),
        format!("Find certificate: {}", config.cert_subject),
        format!("Preserve encoding: {}", config.encoding_policy),
        format!("Server certificates: {}", config.server_cert_policy),
        format!("Log body: {}", if config.log_body { "YES" } else { "NO" }),
        format!("Request timeout: {}s", config.request_timeout.as_secs()),
        format!("Log file: {}", logger.path().display()),
    ];
    for line in &lines {
        logger.record(LogEvent::Startup(line));
    }
}
