//! Error types shared by the gateway engines

use std::io;
use thiserror::Error;

/// Failure reported by a certificate authority client
#[derive(Debug, Error)]
pub enum IssuanceError {
    /// The authority refused because too many certificates were requested
    #[error("certificate authority rate limit reached: {0}")]
    RateLimited(String),

    #[error("certificate issuance failed: {0}")]
    Failed(String),
}

impl IssuanceError {
    /// Classify raw tool output. Let's Encrypt reports its limits as
    /// "too many certificates/failed authorizations/requests".
    pub fn classify(output: &str) -> Self {
        if output.to_ascii_lowercase().contains("too many") {
            IssuanceError::RateLimited(output.trim().to_string())
        } else {
            IssuanceError::Failed(output.trim().to_string())
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, IssuanceError::RateLimited(_))
    }
}

/// Gateway error taxonomy
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("insufficient privilege: {0}")]
    Privilege(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("certificate for {domain} is invalid: {reason}")]
    CertificateInvalid { domain: String, reason: String },

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("websocket handshake error: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    pub(crate) fn invalid_certificate(domain: &str, reason: impl Into<String>) -> Self {
        GatewayError::CertificateInvalid {
            domain: domain.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = IssuanceError::classify(
            "Error creating new order :: too many certificates already issued for exact set of domains",
        );
        assert!(err.is_rate_limited());

        let err = IssuanceError::classify("Error: Too Many failed authorizations recently");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_classify_generic_failure() {
        let err = IssuanceError::classify("Challenge failed for domain example.com\n");
        assert!(!err.is_rate_limited());
        assert_eq!(err.to_string(), "certificate issuance failed: Challenge failed for domain example.com");
    }
}
