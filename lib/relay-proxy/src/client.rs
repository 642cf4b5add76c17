//! Outbound HTTPS client authenticating with the client identity
//!
//! Built once at startup and shared by every transaction, so the identity and the trust
//! policy are the same for every forwarded request.

use crate::mtls::ClientIdentity;
use crate::tls::client_config;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use relay_core::{RelayError, ServerCertPolicy};
use std::error::Error as StdError;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Body type of every forwarded request
pub type OutboundBody = UnsyncBoxBody<Bytes, BoxError>;

pub struct OutboundClient {
    client: Client<HttpsConnector<HttpConnector>, OutboundBody>,
    timeout: Duration,
}

impl OutboundClient {
    pub fn new(
        identity: &ClientIdentity,
        policy: &ServerCertPolicy,
        timeout: Duration,
    ) -> relay_core::Result<Self> {
        let tls = client_config(identity, policy)?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new()).build(https);

        info!(
            "Outbound client initialized (client certificate: {}, server certificate policy: {})",
            identity.subject, policy
        );

        Ok(Self { client, timeout })
    }

    /// Send a request and wait for the response headers.
    ///
    /// Network, TLS and timeout failures become forwarding errors. An HTTP error status from
    /// the target is a normal response.
    pub async fn send(&self, request: Request<OutboundBody>) -> relay_core::Result<Response<Incoming>> {
        debug!("Sending {} {} with {}s timeout", request.method(), request.uri(), self.timeout.as_secs());

        match tokio_timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                debug!("Target responded with status: {}", response.status());
                Ok(response)
            }
            Ok(Err(e)) => {
                let detail = error_chain(&e);
                warn!("Target request error: {}", detail);
                Err(RelayError::Forwarding(detail))
            }
            Err(_) => {
                warn!("Target request timeout after {}s", self.timeout.as_secs());
                Err(RelayError::ForwardingTimeout(self.timeout.as_secs()))
            }
        }
    }
}

/// Flatten an error and its sources into one line
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
