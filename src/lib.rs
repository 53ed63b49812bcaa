//! domaingate - a multi-tenant TLS-terminating gateway
//!
//! Hosts many domains on one machine, each backed by a local process on a
//! Unix socket:
//! - SNI-based certificate selection, certificates re-read per handshake
//! - Automatic certificate issuance and renewal per domain
//! - HTTP relay with a static override directory (used for ACME challenges)
//! - WebSocket upgrade handling on both legs
//! - Domain discovery from the filesystem

pub mod certificate;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod http;
pub mod issuer;
pub mod relay;
pub mod tls;
pub mod watch;

pub use certificate::{check_certificate, CertificateManager, CertificatePolicy, CertificateRecord, PendingTimer};
pub use domain::Domain;
pub use error::{GatewayError, IssuanceError, Result};
pub use gateway::{Gateway, GatewayConfig};
pub use issuer::{CertbotIssuer, CertificateIssuer, IssueRequest};
pub use relay::RelayEngine;
pub use watch::WatchHub;
