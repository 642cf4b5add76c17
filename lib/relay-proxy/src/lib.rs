//! Forwarding relay that presents a client certificate to the target
//!
//! Inbound plain HTTP (or HTTPS) requests are rewritten for the target, sent over mutual
//! TLS, and the response is streamed back. Every transaction is written to a durable log.
pub mod client;
pub mod encoding;
pub mod http;
pub mod logger;
pub mod mtls;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod transform;

pub use client::OutboundClient;
pub use encoding::{Charset, EncodingNegotiator};
pub use http::ForwardingProxy;
pub use logger::{LogEvent, TransactionLog, TransactionLogger};
pub use mtls::ClientIdentity;
pub use relay::{relay, BodyEnd, CapturedBody, LogText, RelayBody};
pub use server::Server;
pub use shutdown::Shutdown;
pub use store::{CertificateResolver, CertificateStore, DirectoryStore, StoreScope};
pub use tls::TlsServerConfig;
pub use transform::{BodyMode, RequestTransformer, TransformedRequest};
