use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("Failed to forward request: {0}")]
    Forwarding(String),

    #[error("Upstream request timed out after {0}s")]
    ForwardingTimeout(u64),

    #[error("Error processing request ({stage}): {message}")]
    Processing { stage: &'static str, message: String },

    #[error("Request cancelled by shutdown")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn processing(stage: &'static str, message: impl ToString) -> Self {
        RelayError::Processing {
            stage,
            message: message.to_string(),
        }
    }

    /// HTTP status reported to the original caller when a transaction fails
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Forwarding(_) => 502,
            RelayError::ForwardingTimeout(_) => 504,
            RelayError::Cancelled => 503,
            _ => 500,
        }
    }

    /// Whether this error happened at the network/TLS layer towards the target
    pub fn is_forwarding_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Forwarding(_) | RelayError::ForwardingTimeout(_)
        )
    }
}
