//! Certificate authority clients.
//! The gateway only needs "issue a certificate for this domain using this
//! webroot"; how that happens is up to the implementation.

use crate::error::IssuanceError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Everything an issuer needs to obtain a certificate for one domain
#[derive(Debug, Clone, Copy)]
pub struct IssueRequest<'a> {
    pub domain: &'a str,
    /// Directory served at the domain's web root over plain HTTP
    pub webroot: &'a Path,
    /// Destination of the full certificate chain
    pub cert_path: &'a Path,
    /// Destination of the private key
    pub key_path: &'a Path,
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Obtain a certificate and place it at `cert_path`/`key_path`
    async fn issue(&self, request: &IssueRequest<'_>) -> Result<(), IssuanceError>;
}

/// Issues certificates by running `certbot` in webroot mode
#[derive(Debug, Clone)]
pub struct CertbotIssuer {
    program: PathBuf,
    live_dir: PathBuf,
}

impl Default for CertbotIssuer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("certbot"),
            live_dir: PathBuf::from("/etc/letsencrypt/live"),
        }
    }
}

impl CertbotIssuer {
    pub fn new(program: impl Into<PathBuf>, live_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            live_dir: live_dir.into(),
        }
    }

    /// Where certbot leaves the artifacts for `domain`
    pub fn live_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let dir = self.live_dir.join(domain);
        (dir.join("fullchain.pem"), dir.join("privkey.pem"))
    }
}

#[async_trait]
impl CertificateIssuer for CertbotIssuer {
    async fn issue(&self, request: &IssueRequest<'_>) -> Result<(), IssuanceError> {
        info!(domain = %request.domain, webroot = %request.webroot.display(), "requesting certificate from certbot");

        let output = Command::new(&self.program)
            .arg("certonly")
            .arg("--webroot")
            .arg("-w")
            .arg(request.webroot)
            .arg("--agree-tos")
            .arg("--register-unsafely-without-email")
            .arg("-n")
            .arg("-d")
            .arg(request.domain)
            .output()
            .await
            .map_err(|e| IssuanceError::Failed(format!("could not run {}: {e}", self.program.display())))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(domain = %request.domain, %stdout, "certbot finished");

        if !output.status.success() {
            return Err(IssuanceError::classify(&format!("{stderr}\n{stdout}")));
        }

        let (chain, key) = self.live_paths(request.domain);
        if !chain.is_file() || !key.is_file() {
            return Err(IssuanceError::Failed(format!(
                "certbot succeeded but {} has no certificate",
                chain.parent().unwrap_or(&self.live_dir).display()
            )));
        }

        copy_artifact(&chain, request.cert_path).await?;
        copy_artifact(&key, request.key_path).await?;
        restrict_permissions(request.key_path).await?;

        info!(domain = %request.domain, "certificate installed");
        Ok(())
    }
}

async fn copy_artifact(from: &Path, to: &Path) -> Result<(), IssuanceError> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|e| IssuanceError::Failed(format!("could not copy {} to {}: {e}", from.display(), to.display())))
}

async fn restrict_permissions(path: &Path) -> Result<(), IssuanceError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| IssuanceError::Failed(format!("could not restrict {}: {e}", path.display())))
}
