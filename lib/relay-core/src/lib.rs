//! Shared configuration and error types for the certificate relay
//!
//! This library provides:
//! - Process-wide proxy configuration and the policies it carries
//! - The error taxonomy used across a forwarded transaction

pub mod config;
pub mod error;

pub use config::{EncodingPolicy, ListenerTls, ProxyConfig, ServerCertPolicy};
pub use error::{RelayError, Result};
