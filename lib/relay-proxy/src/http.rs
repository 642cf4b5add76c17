//! Per-transaction forwarding pipeline
//!
//! `ForwardingProxy::handle` never fails: every error is logged with the stage it happened
//! in and answered with a plain-text error response.

use crate::client::{BoxError, OutboundClient};
use crate::encoding::EncodingNegotiator;
use crate::logger::{LogEvent, TransactionLog, TransactionLogger};
use crate::relay::{relay, BodyEnd, BodyObserver, RelayBody};
use crate::shutdown::Shutdown;
use crate::transform::{BodyMode, RequestTransformer};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use relay_core::{ProxyConfig, RelayError};
use tracing::debug;

/// Forwards one inbound request to the target and relays the answer
pub struct ForwardingProxy {
    client: OutboundClient,
    transformer: RequestTransformer,
    logger: TransactionLogger,
    log_body: bool,
    listen_scheme: &'static str,
    listen_authority: String,
}

impl ForwardingProxy {
    pub fn new(config: &ProxyConfig, client: OutboundClient, logger: TransactionLogger) -> Self {
        let transformer = RequestTransformer::new(
            config.target_url.clone(),
            EncodingNegotiator::new(config.encoding_policy),
            BodyMode::for_logging(config.log_body),
        );
        Self {
            client,
            transformer,
            logger,
            log_body: config.log_body,
            listen_scheme: if config.listens_https() { "https" } else { "http" },
            listen_authority: config
                .listen_url
                .authority()
                .map(|authority| authority.to_string())
                .unwrap_or_else(|| "localhost".to_string()),
        }
    }

    pub fn logger(&self) -> &TransactionLogger {
        &self.logger
    }

    /// Run one transaction, racing it against shutdown
    pub async fn handle<B>(&self, request: Request<B>, shutdown: &Shutdown) -> Response<RelayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let txn = self.logger.transaction();

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(RelayError::Cancelled),
            result = self.forward(request, &txn) => result,
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                txn.record(LogEvent::Error {
                    stage: stage_of(&e),
                    message: &message,
                });
                let response = error_response(&e);
                txn.record(LogEvent::ResponseLine(response.status()));
                response
            }
        }
    }

    async fn forward<B>(
        &self,
        request: Request<B>,
        txn: &TransactionLog,
    ) -> relay_core::Result<Response<RelayBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let url = request_url(
            request.uri(),
            request.headers(),
            self.listen_scheme,
            &self.listen_authority,
        );
        txn.record(LogEvent::RequestLine {
            method: request.method(),
            uri: &url,
        });
        txn.record(LogEvent::RequestHeaders(request.headers()));

        let transformed = self.transformer.transform(request).await?;
        txn.record(LogEvent::RequestEncoding {
            inbound: transformed.inbound_charset.label(),
            outbound: transformed.outbound_charset.label(),
        });
        if self.log_body {
            if let Some(text) = transformed.body_text.as_deref() {
                txn.record(LogEvent::RequestBody(text));
            }
        }
        txn.record(LogEvent::ForwardTarget(&transformed.target));

        let response = self.client.send(transformed.request).await?;
        txn.record(LogEvent::ResponseLine(response.status()));
        txn.record(LogEvent::ResponseHeaders(response.headers()));

        debug!("Relaying {} from {}", response.status(), transformed.target);
        Ok(relay(response, body_logger(txn.clone()), self.log_body))
    }
}

/// Full URL the caller addressed. Origin-form targets are completed from `Host`, or from the
/// listen URL when the caller sent none.
pub fn request_url(uri: &Uri, headers: &HeaderMap, scheme: &str, listen_authority: &str) -> Uri {
    if uri.scheme().is_some() {
        return uri.clone();
    }
    let authority = headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or(listen_authority);
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .unwrap_or_else(|_| uri.clone())
}

/// Logs the response body (when captured) and any failure after the headers were sent
fn body_logger(txn: TransactionLog) -> BodyObserver {
    Box::new(move |end: BodyEnd| {
        if let Some(captured) = end.captured {
            let text = captured.log_text();
            txn.record(LogEvent::ResponseBody {
                text: &text,
                complete: captured.complete,
            });
        }
        if let Some(message) = end.error {
            txn.record(LogEvent::Error {
                stage: "response-body",
                message: &message,
            });
        }
    })
}

/// Pipeline stage an error is reported under
pub fn stage_of(error: &RelayError) -> &'static str {
    match error {
        RelayError::Forwarding(_) | RelayError::ForwardingTimeout(_) => "forward",
        RelayError::Processing { stage, .. } => *stage,
        RelayError::Cancelled => "shutdown",
        RelayError::CertificateNotFound(_) => "certificate",
        RelayError::Tls(_) => "tls",
        RelayError::InvalidConfiguration(_) => "configuration",
        RelayError::Io(_) => "io",
    }
}

/// Plain-text response reported to the caller for a failed transaction
pub fn error_response(error: &RelayError) -> Response<RelayBody> {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let text = format!(
        "{}: {}\n",
        status.canonical_reason().unwrap_or("Error"),
        error
    );

    let mut response = Response::new(
        Full::new(Bytes::from(text))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
