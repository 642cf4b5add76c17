//! Builds the outbound request from an inbound one

use crate::client::{BoxError, OutboundBody};
use crate::encoding::{rewrite_content_type, Charset, EncodingNegotiator};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Uri, Version};
use relay_core::RelayError;
use tracing::debug;

/// How request bodies travel to the target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyMode {
    /// Read the whole body, decode it and re-encode it in the outbound charset
    Buffered,
    /// Forward the body stream as-is
    Streaming,
}

impl BodyMode {
    /// Body logging needs the text, so it forces buffering
    pub fn for_logging(log_body: bool) -> Self {
        if log_body {
            BodyMode::Buffered
        } else {
            BodyMode::Streaming
        }
    }
}

/// Outbound request plus what the transformer learned on the way
pub struct TransformedRequest {
    pub request: Request<OutboundBody>,
    pub target: Uri,
    pub inbound_charset: Charset,
    pub outbound_charset: Charset,
    /// Decoded request body, only in buffered mode
    pub body_text: Option<String>,
}

pub struct RequestTransformer {
    target_base: Uri,
    negotiator: EncodingNegotiator,
    mode: BodyMode,
}

impl RequestTransformer {
    pub fn new(target_base: Uri, negotiator: EncodingNegotiator, mode: BodyMode) -> Self {
        Self {
            target_base,
            negotiator,
            mode,
        }
    }

    pub async fn transform<B>(&self, request: Request<B>) -> relay_core::Result<TransformedRequest>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = target_uri(&self.target_base, path_and_query)?;

        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let inbound_charset = self.negotiator.inbound_charset(content_type.as_deref());
        let outbound_charset = self.negotiator.outbound_charset(&inbound_charset);

        let mut headers = filter_headers(&parts.headers);
        debug!(
            "Filtered headers: {} of {} kept",
            headers.len(),
            parts.headers.len()
        );

        let (body, body_text) = match self.mode {
            BodyMode::Buffered => {
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| {
                        let e: BoxError = e.into();
                        RelayError::processing("request-body", e)
                    })?
                    .to_bytes();

                if bytes.is_empty() {
                    (empty_body(), Some(String::new()))
                } else {
                    let (text, forwarded) =
                        self.negotiator
                            .reencode(&bytes, &inbound_charset, &outbound_charset);
                    let rewritten = rewrite_content_type(content_type.as_deref(), &outbound_charset);
                    let value = HeaderValue::from_str(&rewritten)
                        .map_err(|e| RelayError::processing("content-type", e))?;
                    headers.insert(header::CONTENT_TYPE, value);
                    (full_body(forwarded), Some(text))
                }
            }
            BodyMode::Streaming => {
                if body.is_end_stream() {
                    (empty_body(), None)
                } else {
                    (body.map_err(|e| -> BoxError { e.into() }).boxed_unsync(), None)
                }
            }
        };

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = target.clone();
        *outbound.version_mut() = Version::HTTP_11;
        *outbound.headers_mut() = headers;

        Ok(TransformedRequest {
            request: outbound,
            target,
            inbound_charset,
            outbound_charset,
            body_text,
        })
    }
}

/// Target base with the inbound path and query appended verbatim
pub fn target_uri(base: &Uri, path_and_query: &str) -> relay_core::Result<Uri> {
    let scheme = base.scheme_str().unwrap_or("https");
    let authority = base
        .authority()
        .ok_or_else(|| RelayError::processing("target-uri", "target base has no host"))?;
    let base_path = base.path().trim_end_matches('/');

    let suffix = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{}", path_and_query)
    };

    format!("{}://{}{}{}", scheme, authority, base_path, suffix)
        .parse::<Uri>()
        .map_err(|e| RelayError::processing("target-uri", e))
}

/// Headers the outbound transport manages itself and that are never copied
pub fn is_transport_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "content-length"
            | "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "expect"
    )
}

/// Copy every header except transport-managed ones, keeping all values in order
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !is_transport_header(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

fn empty_body() -> OutboundBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn full_body(bytes: Bytes) -> OutboundBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::EncodingPolicy;

    fn transformer(policy: EncodingPolicy, mode: BodyMode) -> RequestTransformer {
        RequestTransformer::new(
            "https://target.example:9443".parse().unwrap(),
            EncodingNegotiator::new(policy),
            mode,
        )
    }

    async fn body_bytes(request: Request<OutboundBody>) -> Bytes {
        request.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_target_uri_appends_path_and_query() {
        let base: Uri = "https://target.example:9443".parse().unwrap();
        assert_eq!(
            target_uri(&base, "/api/items?id=1&q=a%20b").unwrap().to_string(),
            "https://target.example:9443/api/items?id=1&q=a%20b"
        );

        let base: Uri = "https://target.example/prefix/".parse().unwrap();
        assert_eq!(
            target_uri(&base, "/soap?wsdl").unwrap().to_string(),
            "https://target.example/prefix/soap?wsdl"
        );
        assert_eq!(
            target_uri(&base, "/").unwrap().to_string(),
            "https://target.example/prefix/"
        );
    }

    #[test]
    fn test_target_uri_keeps_special_characters() {
        let base: Uri = "http://127.0.0.1:8000".parse().unwrap();
        let pq = "/search?q=%C3%A5%C3%A4&filter=a:b,c&empty=&x=1;y=2&tag=%7C";
        let uri = target_uri(&base, pq).unwrap();
        assert_eq!(uri.path_and_query().unwrap().as_str(), pq);
    }

    #[test]
    fn test_filter_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:8080"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("7"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("soapaction", HeaderValue::from_static("urn:Get"));
        headers.append("x-custom", HeaderValue::from_static("one"));
        headers.append("x-custom", HeaderValue::from_static("two"));

        let filtered = filter_headers(&headers);
        assert!(filtered.get(header::HOST).is_none());
        assert!(filtered.get(header::CONTENT_LENGTH).is_none());
        assert!(filtered.get(header::CONNECTION).is_none());
        assert_eq!(filtered.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(filtered.get("soapaction").unwrap(), "urn:Get");
        let custom: Vec<_> = filtered.get_all("x-custom").iter().collect();
        assert_eq!(custom, vec!["one", "two"]);

        // Filtering twice changes nothing
        assert_eq!(filter_headers(&filtered), filtered);
    }

    #[tokio::test]
    async fn test_buffered_normalizes_to_utf8() {
        let request = Request::post("/api/items")
            .header(header::CONTENT_TYPE, "application/json; charset=iso-8859-1")
            .header(header::HOST, "localhost:8080")
            .body(Full::new(Bytes::from_static(b"{\"x\":1}")))
            .unwrap();

        let transformed = transformer(EncodingPolicy::NormalizeUtf8, BodyMode::Buffered)
            .transform(request)
            .await
            .unwrap();

        assert_eq!(transformed.target.to_string(), "https://target.example:9443/api/items");
        assert_eq!(transformed.inbound_charset.label(), "iso-8859-1");
        assert!(transformed.outbound_charset.is_utf8());
        assert_eq!(transformed.body_text.as_deref(), Some("{\"x\":1}"));

        let request = transformed.request;
        assert_eq!(request.method(), "POST");
        assert_eq!(
            request.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        assert!(request.headers().get(header::HOST).is_none());
        assert_eq!(&body_bytes(request).await[..], "{\"x\":1}".as_bytes());
    }

    #[tokio::test]
    async fn test_buffered_converts_non_ascii() {
        let request = Request::put("/names")
            .header(header::CONTENT_TYPE, "text/plain; charset=windows-1252")
            .body(Full::new(Bytes::from_static(&[0x4a, 0xf6, 0x72, 0x67])))
            .unwrap();

        let transformed = transformer(EncodingPolicy::NormalizeUtf8, BodyMode::Buffered)
            .transform(request)
            .await
            .unwrap();
        assert_eq!(transformed.body_text.as_deref(), Some("Jörg"));
        assert_eq!(&body_bytes(transformed.request).await[..], "Jörg".as_bytes());
    }

    #[tokio::test]
    async fn test_buffered_preserve_keeps_charset() {
        let latin1 = Bytes::from_static(&[0x4a, 0xf6, 0x72, 0x67]);
        let request = Request::post("/names")
            .header(header::CONTENT_TYPE, "text/plain; charset=iso-8859-1")
            .body(Full::new(latin1.clone()))
            .unwrap();

        let transformed = transformer(EncodingPolicy::Preserve, BodyMode::Buffered)
            .transform(request)
            .await
            .unwrap();
        assert_eq!(transformed.outbound_charset, transformed.inbound_charset);
        assert_eq!(
            transformed.request.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=iso-8859-1"
        );
        assert_eq!(body_bytes(transformed.request).await, latin1);
    }

    #[tokio::test]
    async fn test_buffered_without_content_type() {
        let request = Request::post("/upload")
            .body(Full::new(Bytes::from_static(b"raw")))
            .unwrap();

        let transformed = transformer(EncodingPolicy::NormalizeUtf8, BodyMode::Buffered)
            .transform(request)
            .await
            .unwrap();
        assert_eq!(
            transformed.request.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_empty_body_has_no_content_type_override() {
        for mode in [BodyMode::Buffered, BodyMode::Streaming] {
            let request = Request::get("/status?verbose=1")
                .header(header::CONTENT_TYPE, "application/xml; charset=iso-8859-1")
                .body(Empty::<Bytes>::new())
                .unwrap();

            let transformed = transformer(EncodingPolicy::NormalizeUtf8, mode)
                .transform(request)
                .await
                .unwrap();
            assert_eq!(
                transformed.request.headers().get(header::CONTENT_TYPE).unwrap(),
                "application/xml; charset=iso-8859-1"
            );
            assert!(transformed.request.body().is_end_stream());
            assert!(body_bytes(transformed.request).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_streaming_passes_body_through() {
        let latin1 = Bytes::from_static(&[0x4a, 0xf6, 0x72, 0x67]);
        let request = Request::post("/names")
            .header(header::CONTENT_TYPE, "text/plain; charset=iso-8859-1")
            .header("x-trace", "abc")
            .body(Full::new(latin1.clone()))
            .unwrap();

        let transformed = transformer(EncodingPolicy::NormalizeUtf8, BodyMode::Streaming)
            .transform(request)
            .await
            .unwrap();
        assert!(transformed.body_text.is_none());
        assert_eq!(
            transformed.request.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=iso-8859-1"
        );
        assert_eq!(transformed.request.headers().get("x-trace").unwrap(), "abc");
        assert_eq!(body_bytes(transformed.request).await, latin1);
    }

    #[test]
    fn test_body_mode_for_logging() {
        assert_eq!(BodyMode::for_logging(true), BodyMode::Buffered);
        assert_eq!(BodyMode::for_logging(false), BodyMode::Streaming);
    }
}
