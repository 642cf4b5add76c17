//! Charset negotiation for request bodies
//!
//! The inbound charset comes from the `charset` parameter of the caller's `Content-Type`
//! (UTF-8 when absent or unknown). The outbound charset depends on [`EncodingPolicy`]:
//! `Preserve` keeps the caller's charset, `NormalizeUtf8` always forwards UTF-8. Normalizing
//! is the default, so a target only ever sees UTF-8 unless `--preserve-encoding` is set.

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use relay_core::EncodingPolicy;
use std::fmt;
use tracing::debug;

/// Fallback media type for bodies without a declared content type
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A text encoding plus the label it was declared with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Charset {
    encoding: &'static Encoding,
    label: String,
}

impl Charset {
    pub fn utf8() -> Self {
        Self {
            encoding: UTF_8,
            label: "utf-8".to_string(),
        }
    }

    /// Look up a charset by label (`iso-8859-1`, `"UTF-8"`, `shift_jis`, ...)
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches('"').trim();
        Encoding::for_label(label.as_bytes()).map(|encoding| Self {
            encoding,
            label: label.to_ascii_lowercase(),
        })
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Label used in `Content-Type` and in the log
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_utf8(&self) -> bool {
        self.encoding == UTF_8
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self::utf8()
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Applies the configured [`EncodingPolicy`] to request bodies
#[derive(Clone, Copy, Debug, Default)]
pub struct EncodingNegotiator {
    policy: EncodingPolicy,
}

impl EncodingNegotiator {
    pub fn new(policy: EncodingPolicy) -> Self {
        Self { policy }
    }

    pub fn inbound_charset(&self, content_type: Option<&str>) -> Charset {
        inbound_charset(content_type)
    }

    pub fn outbound_charset(&self, inbound: &Charset) -> Charset {
        outbound_charset(inbound, self.policy)
    }

    /// Decode `body` with the inbound charset and produce the bytes to forward.
    ///
    /// Returns the decoded text (for logging) and the outbound bytes. The original bytes are
    /// forwarded untouched only when they were actually read in the outbound charset, which a
    /// BOM can override.
    pub fn reencode(&self, body: &Bytes, inbound: &Charset, outbound: &Charset) -> (String, Bytes) {
        let (text, used) = decode_detected(inbound, body);
        if used == outbound.encoding {
            return (text, body.clone());
        }
        let encoded = encode(outbound, &text);
        (text, encoded)
    }
}

/// Charset declared by a `Content-Type` value, UTF-8 when absent or unparsable
pub fn inbound_charset(content_type: Option<&str>) -> Charset {
    content_type
        .and_then(charset_param)
        .and_then(Charset::from_label)
        .unwrap_or_default()
}

/// `Preserve` returns the inbound charset verbatim, anything else returns UTF-8
pub fn outbound_charset(inbound: &Charset, policy: EncodingPolicy) -> Charset {
    match policy {
        EncodingPolicy::Preserve => inbound.clone(),
        EncodingPolicy::NormalizeUtf8 => Charset::utf8(),
    }
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim())
    })
}

/// Replace (or add) the charset parameter, keeping the media type and other parameters
pub fn rewrite_content_type(content_type: Option<&str>, charset: &Charset) -> String {
    let content_type = content_type
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    let mut parts = content_type.split(';');
    let mut rewritten = parts.next().unwrap_or(DEFAULT_CONTENT_TYPE).trim().to_string();
    for param in parts {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let is_charset = param
            .split_once('=')
            .map(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
            .unwrap_or(false);
        if !is_charset {
            rewritten.push_str("; ");
            rewritten.push_str(param);
        }
    }
    rewritten.push_str("; charset=");
    rewritten.push_str(charset.label());
    rewritten
}

/// Decode bytes as text. A BOM, if present, wins over the declared charset.
pub fn decode(charset: &Charset, body: &[u8]) -> String {
    decode_detected(charset, body).0
}

/// Like [`decode`], also returning the encoding the bytes were read with
pub fn decode_detected(charset: &Charset, body: &[u8]) -> (String, &'static Encoding) {
    let (text, used, had_errors) = charset.encoding.decode(body);
    if had_errors {
        debug!("Body contained bytes invalid for {}; replaced", used.name());
    }
    (text.into_owned(), used)
}

pub fn encode(charset: &Charset, text: &str) -> Bytes {
    // encoding_rs only encodes to ASCII-compatible charsets
    if charset.encoding == UTF_16LE {
        return text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    }
    if charset.encoding == UTF_16BE {
        return text.encode_utf16().flat_map(u16::to_be_bytes).collect();
    }
    let (bytes, used, unmappable) = charset.encoding.encode(text);
    if unmappable {
        debug!("Body contained characters not representable in {}", used.name());
    }
    Bytes::from(bytes.into_owned())
}
