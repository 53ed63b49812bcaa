//! One hosted domain: its directory layout, certificate manager and relay.

use crate::certificate::{CertificateManager, CertificatePolicy};
use crate::error::{GatewayError, Result};
use crate::issuer::CertificateIssuer;
use crate::relay::RelayEngine;
use crate::watch::{watch_tree, WatchHub};
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const SSL_DIR: &str = "ssl";
const OVERRIDE_DIR: &str = "override-http";
const SOCKET_FILE: &str = "socket";

const SSL_DIR_MODE: u32 = 0o700;
const OVERRIDE_DIR_MODE: u32 = 0o777;

/// A tenant rooted at `root/domains/<name>`
pub struct Domain {
    name: String,
    path: PathBuf,
    hub: Arc<WatchHub>,
    private_watcher: Mutex<Option<RecommendedWatcher>>,
    issuer: Arc<dyn CertificateIssuer>,
    policy: CertificatePolicy,
    certificates: Mutex<Option<Arc<CertificateManager>>>,
    relay: Mutex<Option<Arc<RelayEngine>>>,
    destroyed: AtomicBool,
}

/// Domain name for a directory: its last path segment
pub fn name_from_path(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_ascii_lowercase)
}

impl Domain {
    /// Domain that receives filesystem events from a shared hub
    pub fn new(
        path: impl Into<PathBuf>,
        hub: Arc<WatchHub>,
        issuer: Arc<dyn CertificateIssuer>,
        policy: CertificatePolicy,
    ) -> Result<Self> {
        let path = path.into();
        let name = name_from_path(&path)
            .ok_or_else(|| GatewayError::Config(format!("no domain name in {}", path.display())))?;

        Ok(Self {
            name,
            path,
            hub,
            private_watcher: Mutex::new(None),
            issuer,
            policy,
            certificates: Mutex::new(None),
            relay: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Domain that watches its own directory
    pub fn with_private_watch(
        path: impl Into<PathBuf>,
        issuer: Arc<dyn CertificateIssuer>,
        policy: CertificatePolicy,
    ) -> Result<Self> {
        let path = path.into();
        let hub = WatchHub::new();
        let watcher = watch_tree(&path, hub.clone())?;

        let domain = Self::new(path, hub, issuer, policy)?;
        *domain.private_watcher.lock() = Some(watcher);
        Ok(domain)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ssl_dir(&self) -> PathBuf {
        self.path.join(SSL_DIR)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.ssl_dir().join("cert.pem")
    }

    pub fn key_path(&self) -> PathBuf {
        self.ssl_dir().join("key.pem")
    }

    pub fn override_dir(&self) -> PathBuf {
        self.path.join(OVERRIDE_DIR)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.path.join(SOCKET_FILE)
    }

    /// Prepare the directory layout and start the relay and certificate
    /// manager. Calling it again, or after `destroy`, does nothing.
    pub async fn init(&self) -> Result<()> {
        if self.is_destroyed() || self.relay.lock().is_some() {
            return Ok(());
        }

        ensure_dir(&self.ssl_dir(), SSL_DIR_MODE).await?;
        ensure_dir(&self.override_dir(), OVERRIDE_DIR_MODE).await?;

        let relay = Arc::new(RelayEngine::new(&self.name, self.override_dir(), self.socket_path()));
        let certificates = Arc::new(CertificateManager::new(
            &self.name,
            self.cert_path(),
            self.key_path(),
            self.override_dir(),
            self.issuer.clone(),
            self.policy,
        ));

        {
            let mut relay_slot = self.relay.lock();
            let mut cert_slot = self.certificates.lock();
            // destroy() may have run while the directories were created
            if self.is_destroyed() || relay_slot.is_some() {
                return Ok(());
            }
            *relay_slot = Some(relay);
            *cert_slot = Some(certificates.clone());
        }

        certificates.start(Some(self.hub.subscribe(self.ssl_dir())));
        info!(domain = %self.name, path = %self.path.display(), "domain initialised");
        Ok(())
    }

    pub fn relay(&self) -> Option<Arc<RelayEngine>> {
        self.relay.lock().clone()
    }

    pub fn certificates(&self) -> Option<Arc<CertificateManager>> {
        self.certificates.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Stop watching, then tear down the certificate manager and the relay.
    /// A second call is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.private_watcher.lock().take();
        if let Some(certificates) = self.certificates.lock().take() {
            certificates.destroy();
        }
        if let Some(relay) = self.relay.lock().take() {
            relay.destroy();
        }

        debug!(domain = %self.name, "domain destroyed");
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    if tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(());
    }

    tokio::fs::create_dir_all(path).await?;
    // Applied explicitly so the umask does not narrow it
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}
