//! Copies the target's response onto the inbound response
//!
//! The body is always streamed through unchanged. An observer learns how the stream ended
//! (delivered, failed, or dropped by the caller). With capture enabled a copy of the bytes is
//! kept in memory and handed over too; any decompression for the log happens on that copy only.

use crate::client::BoxError;
use crate::encoding::{decode, inbound_charset, DEFAULT_CONTENT_TYPE};
use bytes::{Bytes, BytesMut};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::Response;
use std::fmt;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// Body type of every relayed response
pub type RelayBody = UnsyncBoxBody<Bytes, BoxError>;

/// Told how the response body stream ended
pub type BodyObserver = Box<dyn FnOnce(BodyEnd) + Send>;

/// In-memory copy of a relayed response body
#[derive(Debug, Clone)]
pub struct CapturedBody {
    pub bytes: Bytes,
    /// `false` when the stream ended early (caller went away, upstream error)
    pub complete: bool,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
}

impl CapturedBody {
    /// Human-readable text for the log, decompressed when the response was compressed
    pub fn log_text(&self) -> LogText {
        let charset = inbound_charset(self.content_type.as_deref());
        let encoding = self
            .content_encoding
            .as_deref()
            .map(|e| e.trim().to_ascii_lowercase());

        match encoding.as_deref() {
            None | Some("") | Some("identity") => LogText::Plain(decode(&charset, &self.bytes)),
            Some(encoding) => match decompress(encoding, &self.bytes) {
                Some(plain) => LogText::Decompressed(decode(&charset, &plain)),
                None => LogText::Undecodable {
                    encoding: encoding.to_string(),
                    len: self.bytes.len(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogText {
    Plain(String),
    Decompressed(String),
    /// Compressed with an encoding we cannot (or failed to) decompress
    Undecodable { encoding: String, len: usize },
}

fn decompress(encoding: &str, data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let result = match encoding {
        "gzip" | "x-gzip" => GzDecoder::new(data).read_to_end(&mut out),
        // "deflate" is zlib-wrapped per RFC 9110, but raw deflate shows up in the wild
        "deflate" => ZlibDecoder::new(data).read_to_end(&mut out).or_else(|_| {
            out.clear();
            DeflateDecoder::new(data).read_to_end(&mut out)
        }),
        _ => return None,
    };
    match result {
        Ok(_) => Some(out),
        Err(e) => {
            debug!("Failed to decompress {} body for logging: {}", encoding, e);
            None
        }
    }
}

/// How a relayed body stream finished
#[derive(Debug)]
pub struct BodyEnd {
    /// Why the body was cut short, `None` when it was delivered in full
    pub error: Option<String>,
    /// Copy of the body, only when capture was requested
    pub captured: Option<CapturedBody>,
}

/// Body wrapper that forwards every frame, optionally keeping a copy of the data, and
/// reports to its observer exactly once when the stream ends, fails or is dropped
pub struct TeeBody<B: Body> {
    inner: B,
    captured: Option<BytesMut>,
    observer: Option<BodyObserver>,
    content_encoding: Option<String>,
    content_type: Option<String>,
}

impl<B: Body> TeeBody<B> {
    pub fn new(inner: B, headers: &HeaderMap, observer: BodyObserver, capture: bool) -> Self {
        let header_str = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            inner,
            captured: capture.then(BytesMut::new),
            observer: Some(observer),
            content_encoding: header_str(header::CONTENT_ENCODING),
            content_type: header_str(header::CONTENT_TYPE),
        }
    }

    fn finish(&mut self, error: Option<String>) {
        let Some(observer) = self.observer.take() else {
            return;
        };
        let complete = error.is_none();
        let captured = self.captured.take().map(|bytes| CapturedBody {
            bytes: bytes.freeze(),
            complete,
            content_encoding: self.content_encoding.take(),
            content_type: self.content_type.take(),
        });
        observer(BodyEnd { error, captured });
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(captured), Some(data)) = (this.captured.as_mut(), frame.data_ref()) {
                    captured.extend_from_slice(data);
                }
                // Sized bodies may never be polled again after their last frame
                if this.inner.is_end_stream() {
                    this.finish(None);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(Some(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for TeeBody<B> {
    fn drop(&mut self) {
        // Empty and HEAD bodies may be dropped without a poll; anything else is an abort
        let error = (!self.inner.is_end_stream())
            .then(|| "body dropped before the end of the stream (caller disconnected)".to_string());
        self.finish(error);
    }
}

/// Headers that describe the upstream connection rather than the response
fn is_connection_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy response headers: one name maps to the upstream's full value list.
///
/// `Content-Type` falls back to `application/octet-stream` when the target sends none.
pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.keys_len() + 1);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DEFAULT_CONTENT_TYPE),
    );

    for name in upstream.keys() {
        if is_connection_header(name) {
            continue;
        }
        headers.remove(name);
        for value in upstream.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Turn the target's response into the inbound response.
///
/// Status and headers are copied verbatim and the body is streamed through. The observer
/// always learns how the body ended; with `capture` set it also receives a copy of the body.
pub fn relay<B>(
    response: Response<B>,
    observer: BodyObserver,
    capture: bool,
) -> Response<RelayBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let headers = relay_headers(&parts.headers);

    let body = body.map_err(|e| -> BoxError { e.into() });
    let body = TeeBody::new(body, &parts.headers, observer, capture).boxed_unsync();

    let mut relayed = Response::new(body);
    *relayed.status_mut() = parts.status;
    *relayed.headers_mut() = headers;
    relayed
}
