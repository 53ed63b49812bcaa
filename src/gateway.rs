//! Gateway: domain discovery, the SNI-dispatching TLS listener and the
//! plaintext listener.

use crate::certificate::CertificatePolicy;
use crate::domain::{name_from_path, Domain};
use crate::error::{GatewayError, Result};
use crate::http::{plain_response, read_head, RequestHead};
use crate::issuer::CertificateIssuer;
use crate::tls;
use crate::watch::{watch_tree, FsEventKind, Subscription, WatchHub};
use dashmap::mapref::entry::Entry;
use bytes::BytesMut;
use dashmap::DashMap;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Data root; domains live in `root/domains/<name>`
    pub root: PathBuf,
    /// Create `root` when it does not exist
    pub create_dir: bool,
    pub tls_addr: SocketAddr,
    pub plaintext_addr: SocketAddr,
    /// Refuse to start without root privileges
    pub require_privilege: bool,
    pub policy: CertificatePolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./gateway-data"),
            create_dir: false,
            tls_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            plaintext_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            require_privilege: true,
            policy: CertificatePolicy::default(),
        }
    }
}

pub struct Gateway {
    root: PathBuf,
    domains_dir: PathBuf,
    domains: DashMap<String, Arc<Domain>>,
    hub: Arc<WatchHub>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    issuer: Arc<dyn CertificateIssuer>,
    policy: CertificatePolicy,
    shutdown: CancellationToken,
    tls_addr: SocketAddr,
    plaintext_addr: Option<SocketAddr>,
}

/// Name of the domain whose directory is `path`, when `path` is exactly one
/// segment below `domains_dir`
pub fn domain_name_for(domains_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(domains_dir).ok()?;
    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => name_from_path(path),
        _ => None,
    }
}

const OWNER_MARKER: &str = ".domaingate-owner";

/// Whether the process runs as root, judged by the owner of a file it
/// creates in `dir`
async fn has_privilege(dir: &Path) -> Result<bool> {
    let marker = dir.join(OWNER_MARKER);
    tokio::fs::write(&marker, b"").await?;
    let owner = tokio::fs::metadata(&marker).await.map(|m| m.uid());
    let _ = tokio::fs::remove_file(&marker).await;
    Ok(owner? == 0)
}

impl Gateway {
    /// Prepare the data root, bind the listeners, adopt existing domains and
    /// start watching for new ones.
    pub async fn start(config: GatewayConfig, issuer: Arc<dyn CertificateIssuer>) -> Result<Arc<Self>> {
        if !config.root.is_dir() {
            if !config.create_dir {
                return Err(GatewayError::Config(format!(
                    "data directory {} does not exist",
                    config.root.display()
                )));
            }
            tokio::fs::create_dir_all(&config.root).await?;
            info!(path = %config.root.display(), "created data directory");
        }

        let root = tokio::fs::canonicalize(&config.root).await?;
        if config.require_privilege && !has_privilege(&root).await? {
            return Err(GatewayError::Privilege(
                "binding the gateway ports requires root, disable the check for unprivileged runs".to_string(),
            ));
        }

        let domains_dir = root.join("domains");
        tokio::fs::create_dir_all(&domains_dir).await?;

        let tls_listener = TcpListener::bind(config.tls_addr).await.map_err(|e| {
            GatewayError::Config(format!("could not bind TLS listener on {}: {e}", config.tls_addr))
        })?;
        let tls_addr = tls_listener.local_addr()?;

        let plaintext_listener = match TcpListener::bind(config.plaintext_addr).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(addr = %config.plaintext_addr, error = %e, "plaintext listener unavailable, continuing without it");
                None
            }
        };
        let plaintext_addr = plaintext_listener.as_ref().and_then(|l| l.local_addr().ok());

        let hub = WatchHub::new();
        let discovery = hub.subscribe(&domains_dir);
        let watcher = watch_tree(&root, hub.clone())?;

        let gateway = Arc::new(Self {
            root,
            domains_dir,
            domains: DashMap::new(),
            hub,
            watcher: Mutex::new(Some(watcher)),
            issuer,
            policy: config.policy,
            shutdown: CancellationToken::new(),
            tls_addr,
            plaintext_addr,
        });

        gateway.scan().await?;

        tokio::spawn(gateway.clone().discovery_loop(discovery));
        tokio::spawn(gateway.clone().tls_loop(tls_listener));
        if let Some(listener) = plaintext_listener {
            tokio::spawn(gateway.clone().plaintext_loop(listener));
        }

        info!(
            root = %gateway.root.display(),
            tls = %tls_addr,
            plaintext = ?plaintext_addr,
            domains = gateway.domains.len(),
            "gateway started"
        );
        Ok(gateway)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tls_addr(&self) -> SocketAddr {
        self.tls_addr
    }

    pub fn plaintext_addr(&self) -> Option<SocketAddr> {
        self.plaintext_addr
    }

    /// Active domain by name, case-insensitive
    pub fn domain(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop listening and watching, and destroy every domain
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.watcher.lock().take();

        let names: Vec<String> = self.domains.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, domain)) = self.domains.remove(&name) {
                domain.destroy();
            }
        }
        info!("gateway stopped");
    }

    /// Adopt every domain directory already present
    async fn scan(self: &Arc<Self>) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.domains_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                self.ensure_domain(&entry.path());
            }
        }
        Ok(())
    }

    /// Create and initialise the domain for `path` unless one with the same
    /// name already exists
    fn ensure_domain(self: &Arc<Self>, path: &Path) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Some(name) = domain_name_for(&self.domains_dir, path) else {
            return;
        };

        let domain = match self.domains.entry(name) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                match Domain::new(path, self.hub.clone(), self.issuer.clone(), self.policy) {
                    Ok(domain) => slot.insert(Arc::new(domain)).value().clone(),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "could not create domain");
                        return;
                    }
                }
            }
        };

        info!(domain = %domain.name(), "domain discovered");
        let gateway = self.clone();
        tokio::spawn(async move {
            if let Err(e) = domain.init().await {
                error!(domain = %domain.name(), error = %e, "domain initialisation failed");
                gateway
                    .domains
                    .remove_if(domain.name(), |_, active| Arc::ptr_eq(active, &domain));
                domain.destroy();
            }
        });
    }

    /// Destroy every domain whose directory is gone
    fn prune(&self) {
        let gone: Vec<String> = self
            .domains
            .iter()
            .filter(|e| !e.value().path().is_dir())
            .map(|e| e.key().clone())
            .collect();

        for name in gone {
            if let Some((_, domain)) = self.domains.remove(&name) {
                info!(domain = %name, "domain directory removed");
                domain.destroy();
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>, mut events: Subscription) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event.kind {
                FsEventKind::Removed => self.prune(),
                FsEventKind::Renamed => {
                    self.prune();
                    if event.path.is_dir() {
                        self.ensure_domain(&event.path);
                    }
                }
                FsEventKind::Created | FsEventKind::Modified => {
                    if event.path.is_dir() {
                        self.ensure_domain(&event.path);
                    }
                }
            }
        }
        debug!("discovery loop stopped");
    }

    async fn tls_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "TLS accept failed");
                        continue;
                    }
                },
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.serve_tls(stream).await {
                    debug!(%peer, error = %e, "TLS connection ended with error");
                }
            });
        }
        debug!("TLS listener stopped");
    }

    /// Pick the domain from the ClientHello's SNI name and hand the
    /// established stream to its relay. The certificate pair is read from
    /// disk for every handshake.
    async fn serve_tls(&self, stream: TcpStream) -> Result<()> {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;

        let sni = start.client_hello().server_name().map(str::to_ascii_lowercase);
        let domain = sni
            .as_deref()
            .and_then(|name| self.domain(name))
            .ok_or_else(|| GatewayError::DomainNotFound(sni.clone().unwrap_or_default()))?;
        let relay = domain
            .relay()
            .ok_or_else(|| GatewayError::DomainNotFound(domain.name().to_string()))?;

        let config = tls::load_server_config(&domain.cert_path(), &domain.key_path()).await?;
        let tls_stream = start.into_stream(config).await?;

        relay.handle_raw_connection(tls_stream).await
    }

    async fn plaintext_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "plaintext accept failed");
                        continue;
                    }
                },
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.serve_plaintext(stream).await {
                    debug!(%peer, error = %e, "plaintext connection ended with error");
                }
            });
        }
        debug!("plaintext listener stopped");
    }

    async fn serve_plaintext(&self, mut stream: TcpStream) -> Result<()> {
        let result = self.route_plaintext(&mut stream).await;
        let _ = stream.shutdown().await;
        result
    }

    /// Tag each request on the connection as plaintext and route it by its
    /// own Host header
    async fn route_plaintext(&self, stream: &mut TcpStream) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            let head = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                head = read_head(stream, &mut buf) => head?,
            };
            let Some(mut head) = head else {
                return Ok(());
            };
            tag_plaintext(&mut head);

            let host = head.host();
            let relay = host
                .as_deref()
                .and_then(|h| self.domain(h))
                .and_then(|d| d.relay());

            let Some(relay) = relay else {
                let body = match &host {
                    Some(host) => format!("Host {host} not found"),
                    None => "Host not found".to_string(),
                };
                debug!(host = host.as_deref().unwrap_or("-"), "no domain for plaintext request");
                stream.write_all(&plain_response(StatusCode::NOT_FOUND, &body)).await?;
                return Ok(());
            };

            if !relay.serve_request(head, &mut buf, stream).await? {
                return Ok(());
            }
        }
    }
}

fn tag_plaintext(head: &mut RequestHead) {
    head.headers.insert("x-plaintext", HeaderValue::from_static("true"));
    head.headers
        .insert("x-forwarded-protocol", HeaderValue::from_static("http"));
}
