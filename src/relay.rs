//! Relay engine for one domain.
//!
//! Serves files from the domain's override directory, and relays everything
//! else to the backend listening on the domain's Unix socket. Connections are
//! handled one request at a time: each request is written to a fresh backend
//! connection as a literal head followed by its framed body, and the framed
//! response comes back untouched.

use crate::error::{GatewayError, Result};
use crate::handshake;
use crate::http::{forward_body, plain_response, read_head, read_response_head, BodyFraming, RequestHead};
use bytes::BytesMut;
use hyper::{Method, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inbound connection the relay can work with: TCP, TLS or in-memory
pub trait InboundStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> InboundStream for T {}

/// Resolve a request path inside `override_dir` without touching the
/// filesystem. Returns `None` for paths that climb above the directory or
/// name the directory itself.
pub fn resolve_override(override_dir: &Path, request_path: &str) -> Option<PathBuf> {
    let path = request_path.split(['?', '#']).next().unwrap_or("");

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return None;
    }

    Some(segments.iter().fold(override_dir.to_path_buf(), |acc, s| acc.join(s)))
}

/// Content type from file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Per-domain relay
pub struct RelayEngine {
    domain: String,
    override_dir: PathBuf,
    socket_path: PathBuf,
    accepting: AtomicBool,
    shutdown: CancellationToken,
}

impl RelayEngine {
    pub fn new(domain: impl Into<String>, override_dir: impl Into<PathBuf>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            domain: domain.into(),
            override_dir: override_dir.into(),
            socket_path: socket_path.into(),
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting sessions and end the ones in flight. Idempotent.
    pub fn destroy(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            self.shutdown.cancel();
            debug!(domain = %self.domain, "relay engine destroyed");
        }
    }

    /// Serve every request on a connection whose Host is already known (TLS)
    pub async fn handle_raw_connection<S: InboundStream>(&self, mut inbound: S) -> Result<()> {
        let result = self.serve_connection(&mut inbound).await;
        let _ = inbound.shutdown().await;
        result
    }

    async fn serve_connection<S: InboundStream>(&self, inbound: &mut S) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if !self.is_accepting() {
                self.reject(inbound).await;
                return Ok(());
            }

            let head = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                head = read_head(inbound, &mut buf) => head?,
            };
            let Some(head) = head else {
                return Ok(());
            };

            if !self.serve_request(head, &mut buf, inbound).await? {
                return Ok(());
            }
        }
    }

    /// Serve one request whose head was already read off the connection.
    /// `buf` holds the bytes read past it and keeps whatever follows the
    /// request's body. Returns whether the connection can carry another
    /// request.
    pub async fn serve_request<S: InboundStream>(&self, head: RequestHead, buf: &mut BytesMut, inbound: &mut S) -> Result<bool> {
        if !self.is_accepting() {
            self.reject(inbound).await;
            return Ok(false);
        }

        let session = async {
            if head.is_websocket_upgrade() {
                self.handle_upgrade(head, buf, inbound).await
            } else {
                self.handle_request(head, buf, inbound).await
            }
        };

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(false),
            result = session => result,
        };

        if let Err(e) = &result {
            warn!(domain = %self.domain, error = %e, "relay session failed");
        }
        result
    }

    async fn reject<S: InboundStream>(&self, inbound: &mut S) {
        let _ = inbound
            .write_all(&plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"))
            .await;
        debug!(domain = %self.domain, "rejected request on a destroyed relay");
    }

    /// Serve an override file, or relay the request and its response
    pub async fn handle_request<S: InboundStream>(&self, head: RequestHead, buf: &mut BytesMut, inbound: &mut S) -> Result<bool> {
        let keep_alive = head.keep_alive();
        let request_body = head.body_framing()?;

        if let Some(file) = self.override_file(&head.path).await {
            forward_body(request_body, buf, inbound, &mut tokio::io::sink()).await?;
            self.serve_override(&head, &file, keep_alive, inbound).await?;
            return Ok(keep_alive);
        }

        let mut backend = self.connect_backend(inbound).await?;
        backend.write_all(&head.serialize()).await.map_err(relay_error)?;
        debug!(domain = %self.domain, method = %head.method, path = %head.path, "relaying to backend");

        let end = {
            let (mut backend_read, mut backend_write) = backend.split();
            let (mut inbound_read, mut inbound_write) = tokio::io::split(&mut *inbound);

            let upstream = forward_body(request_body, buf, &mut inbound_read, &mut backend_write);
            let downstream = relay_response(&head.method, &mut backend_read, &mut inbound_write);
            let ((), end) = tokio::try_join!(upstream, downstream)?;
            end
        };

        match end {
            ResponseEnd::KeepAlive => Ok(keep_alive),
            ResponseEnd::Close => Ok(false),
            ResponseEnd::Switched => {
                if !buf.is_empty() {
                    backend.write_all(&buf.split()).await.map_err(relay_error)?;
                }
                splice(inbound, &mut backend).await?;
                Ok(false)
            }
        }
    }

    /// Upgrade both legs to WebSocket and pipe them together. The connection
    /// carries nothing else afterwards.
    pub async fn handle_upgrade<S: InboundStream>(&self, head: RequestHead, buf: &mut BytesMut, inbound: &mut S) -> Result<bool> {
        let accepted = match handshake::server_handshake(&head.headers) {
            Ok(accepted) => accepted,
            Err(e) => {
                let _ = inbound
                    .write_all(&plain_response(StatusCode::BAD_REQUEST, "Bad WebSocket Upgrade"))
                    .await;
                return Err(e);
            }
        };

        let mut backend = self.connect_backend(inbound).await?;

        let upstream = match handshake::client_handshake(&head.path, &mut backend, &head.headers).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = inbound.write_all(&plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")).await;
                return Err(e);
            }
        };

        inbound.write_all(&accepted.response_bytes()).await.map_err(relay_error)?;
        if !upstream.leftover.is_empty() {
            inbound.write_all(&upstream.leftover).await.map_err(relay_error)?;
        }
        if !buf.is_empty() {
            backend.write_all(&buf.split()).await.map_err(relay_error)?;
        }

        info!(
            domain = %self.domain,
            path = %head.path,
            protocol = accepted.protocol.as_deref().unwrap_or("-"),
            "websocket session established"
        );
        splice(inbound, &mut backend).await?;
        Ok(false)
    }

    /// Existing regular file inside the override directory for this path
    async fn override_file(&self, request_path: &str) -> Option<PathBuf> {
        let candidate = resolve_override(&self.override_dir, request_path)?;
        let resolved = tokio::fs::canonicalize(&candidate).await.ok()?;
        let root = tokio::fs::canonicalize(&self.override_dir).await.ok()?;

        // Symlinks may still point outside
        if !resolved.starts_with(&root) {
            warn!(domain = %self.domain, path = %request_path, "override path escapes its directory");
            return None;
        }

        let metadata = tokio::fs::metadata(&resolved).await.ok()?;
        metadata.is_file().then_some(candidate)
    }

    async fn serve_override<S: InboundStream>(&self, head: &RequestHead, file: &Path, keep_alive: bool, inbound: &mut S) -> Result<()> {
        let mut source = tokio::fs::File::open(file).await?;
        let length = source.metadata().await?.len();

        let response_head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ncontent-length: {}\r\n{}\r\n",
            content_type_for(file),
            length,
            if keep_alive { "" } else { "connection: close\r\n" }
        );
        inbound.write_all(response_head.as_bytes()).await.map_err(relay_error)?;
        if head.method != Method::HEAD {
            tokio::io::copy(&mut source, inbound).await.map_err(relay_error)?;
        }
        inbound.flush().await.map_err(relay_error)?;

        debug!(domain = %self.domain, path = %head.path, bytes = length, "served override file");
        Ok(())
    }

    async fn connect_backend<S: InboundStream>(&self, inbound: &mut S) -> Result<UnixStream> {
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                let _ = inbound.write_all(&plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")).await;
                Err(GatewayError::Relay(format!(
                    "could not connect to backend {}: {e}",
                    self.socket_path.display()
                )))
            }
        }
    }
}

/// How a relayed response left the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseEnd {
    KeepAlive,
    Close,
    /// The backend answered 101 and the connection now speaks another protocol
    Switched,
}

/// Copy interim responses and the final response from the backend, stopping
/// at the end of the final response's body
async fn relay_response<R, W>(request_method: &Method, backend: &mut R, inbound: &mut W) -> Result<ResponseEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let (head, raw) = read_response_head(backend, &mut buf).await?;
        inbound.write_all(&raw).await.map_err(relay_error)?;

        if head.status == 101 {
            if !buf.is_empty() {
                inbound.write_all(&buf.split()).await.map_err(relay_error)?;
            }
            return Ok(ResponseEnd::Switched);
        }
        if head.is_interim() {
            continue;
        }

        let framing = head.body_framing(request_method)?;
        forward_body(framing, &mut buf, backend, inbound).await?;
        inbound.flush().await.map_err(relay_error)?;

        return Ok(if framing == BodyFraming::UntilClose || !head.keep_alive() {
            ResponseEnd::Close
        } else {
            ResponseEnd::KeepAlive
        });
    }
}

fn relay_error(e: std::io::Error) -> GatewayError {
    GatewayError::Relay(e.to_string())
}

/// Pipe the two legs together. The backend finishing (or either leg
/// failing) ends the session; a client half-close is passed on to the
/// backend so its response can still arrive.
async fn splice<S: InboundStream>(inbound: &mut S, backend: &mut UnixStream) -> Result<()> {
    let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
    let (mut backend_read, mut backend_write) = backend.split();

    let upstream = async {
        tokio::io::copy(&mut inbound_read, &mut backend_write).await?;
        backend_write.shutdown().await
    };
    let downstream = async {
        tokio::io::copy(&mut backend_read, &mut inbound_write).await?;
        inbound_write.shutdown().await
    };
    tokio::pin!(upstream, downstream);

    let result = tokio::select! {
        result = &mut downstream => result,
        result = &mut upstream => match result {
            Ok(()) => (&mut downstream).await,
            Err(e) => Err(e),
        },
    };
    result.map_err(relay_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    struct Fixture {
        dir: TempDir,
        engine: std::sync::Arc<RelayEngine>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let domain_dir = dir.path().join("example.com");
        std::fs::create_dir_all(domain_dir.join("override-http")).unwrap();
        let engine = std::sync::Arc::new(RelayEngine::new(
            "example.com",
            domain_dir.join("override-http"),
            domain_dir.join("socket"),
        ));
        Fixture { dir, engine }
    }

    impl Fixture {
        fn domain_dir(&self) -> PathBuf {
            self.dir.path().join("example.com")
        }

        fn override_dir(&self) -> PathBuf {
            self.domain_dir().join("override-http")
        }

        fn backend(&self) -> UnixListener {
            UnixListener::bind(self.domain_dir().join("socket")).unwrap()
        }

        /// Send `request` through the relay and collect the whole response
        async fn exchange(&self, request: &[u8]) -> String {
            let (mut client, server): (DuplexStream, DuplexStream) = duplex(64 * 1024);
            let engine = self.engine.clone();
            let session = tokio::spawn(async move { engine.handle_raw_connection(server).await });

            client.write_all(request).await.unwrap();
            client.shutdown().await.unwrap();
            let mut response = Vec::new();
            timeout(Duration::from_secs(5), client.read_to_end(&mut response))
                .await
                .unwrap()
                .unwrap();
            drop(client);
            let _ = session.await;
            String::from_utf8_lossy(&response).to_string()
        }
    }

    #[test]
    fn test_resolve_override_inside() {
        let root = Path::new("/srv/override");
        assert_eq!(resolve_override(root, "/a.txt"), Some(root.join("a.txt")));
        assert_eq!(
            resolve_override(root, "/.well-known/acme-challenge/tok?x=1"),
            Some(root.join(".well-known/acme-challenge/tok"))
        );
        assert_eq!(resolve_override(root, "/a/../b.txt"), Some(root.join("b.txt")));
        assert_eq!(resolve_override(root, "//a//./b"), Some(root.join("a/b")));
    }

    #[test]
    fn test_resolve_override_rejects_escape() {
        let root = Path::new("/srv/override");
        assert_eq!(resolve_override(root, "/../secret.txt"), None);
        assert_eq!(resolve_override(root, "/a/../../secret.txt"), None);
        assert_eq!(resolve_override(root, "/../override/a.txt"), None);
        assert_eq!(resolve_override(root, "/"), None);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.txt")), "text/plain");
        assert_eq!(content_type_for(Path::new("index.HTML")), "text/html");
        assert_eq!(content_type_for(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("archive.tar.gz")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("token")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_override_file_served_without_backend() {
        let f = fixture();
        std::fs::write(f.override_dir().join("a.txt"), "hello, world").unwrap();
        let backend = f.backend();

        let response = f.exchange(b"GET /a.txt HTTP/1.1\r\nHost: example.com\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-length: 12\r\n"));
        assert!(response.contains("content-type: text/plain\r\n"));
        assert!(response.ends_with("\r\n\r\nhello, world"));

        assert!(timeout(Duration::from_millis(100), backend.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_head_request_has_no_body() {
        let f = fixture();
        std::fs::write(f.override_dir().join("a.txt"), "hello, world").unwrap();

        let response = f.exchange(b"HEAD /a.txt HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(response.contains("content-length: 12\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_traversal_is_forwarded_not_served() {
        let f = fixture();
        std::fs::write(f.domain_dir().join("secret.txt"), "top secret").unwrap();
        let backend = f.backend();

        let backend_task = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 7\r\n\r\nbackend")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let response = f
            .exchange(b"GET /../secret.txt HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await;
        let forwarded = backend_task.await.unwrap();

        assert!(forwarded.starts_with("GET /../secret.txt HTTP/1.1\r\n"));
        assert!(!response.contains("top secret"));
        assert!(response.ends_with("backend"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_not_served() {
        let f = fixture();
        std::fs::write(f.domain_dir().join("secret.txt"), "top secret").unwrap();
        std::os::unix::fs::symlink(f.domain_dir().join("secret.txt"), f.override_dir().join("link.txt")).unwrap();

        // No backend: the request falls through and gets a 502
        let response = f.exchange(b"GET /link.txt HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
        assert!(!response.contains("top secret"));
    }

    #[tokio::test]
    async fn test_request_relayed_verbatim() {
        let f = fixture();
        let backend = f.backend();

        let backend_task = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 4096];
            while !received.ends_with(b"ping") {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }
            // Deliberately odd casing and spacing: must arrive untouched
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nX-Odd-Header:  kept\r\ncontent-length: 4\r\n\r\npong")
                .await
                .unwrap();
            String::from_utf8(received).unwrap()
        });

        let response = f
            .exchange(b"POST /api?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nping")
            .await;
        let forwarded = backend_task.await.unwrap();

        assert_eq!(
            forwarded,
            "POST /api?x=1 HTTP/1.1\r\nhost:example.com\r\ncontent-length:4\r\n\r\nping"
        );
        assert_eq!(
            response,
            "HTTP/1.1 201 Created\r\nX-Odd-Header:  kept\r\ncontent-length: 4\r\n\r\npong"
        );
    }

    /// Accept one backend connection, answer the first request head with
    /// `response` and return everything the relay sent on it
    fn answer_once(backend: UnixListener, until: &'static [u8], response: &'static [u8]) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 4096];
            while !received.ends_with(until) {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response).await.unwrap();

            // The relay hangs up once the response is through
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            String::from_utf8(received).unwrap()
        })
    }

    #[tokio::test]
    async fn test_pipelined_requests_are_handled_one_by_one() {
        let f = fixture();
        std::fs::write(f.override_dir().join("a.txt"), "hello, world").unwrap();
        let backend = answer_once(
            f.backend(),
            b"\r\n\r\n",
            b"HTTP/1.1 200 OK\r\ncontent-length: 7\r\n\r\nbackend",
        );

        let response = f
            .exchange(
                b"GET /a.txt HTTP/1.1\r\nHost: example.com\r\n\r\n\
                  GET /app HTTP/1.1\r\nHost: example.com\r\n\r\n\
                  GET /a.txt HTTP/1.1\r\nHost: example.com\r\n\r\n",
            )
            .await;
        let forwarded = timeout(Duration::from_secs(5), backend).await.unwrap().unwrap();

        assert_eq!(forwarded, "GET /app HTTP/1.1\r\nhost:example.com\r\n\r\n");
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 3);
        assert!(!response.contains("connection: close"));
        let backend_at = response.find("backend").unwrap();
        assert!(response[..backend_at].contains("hello, world"));
        assert!(response[backend_at..].ends_with("\r\n\r\nhello, world"));
    }

    #[tokio::test]
    async fn test_chunked_bodies_are_framed() {
        let f = fixture();
        std::fs::write(f.override_dir().join("a.txt"), "hello, world").unwrap();
        let backend = answer_once(
            f.backend(),
            b"0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\npong\r\n0\r\n\r\n",
        );

        let response = f
            .exchange(
                b"POST /api HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nping\r\n0\r\n\r\n\
                  GET /a.txt HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
            )
            .await;
        let forwarded = timeout(Duration::from_secs(5), backend).await.unwrap().unwrap();

        assert_eq!(
            forwarded,
            "POST /api HTTP/1.1\r\nhost:example.com\r\ntransfer-encoding:chunked\r\n\r\n4\r\nping\r\n0\r\n\r\n"
        );
        assert!(response.starts_with(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\npong\r\n0\r\n\r\nHTTP/1.1 200 OK\r\n"
        ));
        assert!(response.contains("connection: close\r\n"));
        assert!(response.ends_with("\r\n\r\nhello, world"));
    }

    #[tokio::test]
    async fn test_client_close_ends_after_one_request() {
        let f = fixture();
        std::fs::write(f.override_dir().join("a.txt"), "hello, world").unwrap();

        let (mut client, server) = duplex(64 * 1024);
        let engine = f.engine.clone();
        let session = tokio::spawn(async move { engine.handle_raw_connection(server).await });

        // Write side stays open: the session must end on its own
        client
            .write_all(b"GET /a.txt HTTP/1.0\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();

        assert!(timeout(Duration::from_secs(5), session).await.unwrap().unwrap().is_ok());
        assert!(String::from_utf8_lossy(&response).contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_missing_backend_is_bad_gateway() {
        let f = fixture();
        let response = f.exchange(b"GET /app HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn test_upgrade_without_key_is_rejected() {
        let f = fixture();
        let backend = f.backend();

        let response = f
            .exchange(b"GET /ws HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(timeout(Duration::from_millis(100), backend.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_websocket_session_is_piped() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::Message;

        let f = fixture();
        let backend = f.backend();
        tokio::spawn(async move {
            let (stream, _) = backend.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });

        let (client, server) = duplex(64 * 1024);
        let engine = f.engine.clone();
        tokio::spawn(async move { engine.handle_raw_connection(server).await });

        let mut request = "ws://example.com/ws".into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", "foo, json".parse().unwrap());
        let (mut ws, response) = timeout(Duration::from_secs(5), tokio_tungstenite::client_async(request, client))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            response.headers().get("sec-websocket-protocol").unwrap(),
            "json"
        );

        ws.send(Message::Text("hello".into())).await.unwrap();
        let echoed = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(echoed, Message::Text("hello".into()));
    }

    #[tokio::test]
    async fn test_destroyed_relay_rejects_connections() {
        let f = fixture();
        std::fs::write(f.override_dir().join("a.txt"), "hello, world").unwrap();

        f.engine.destroy();
        f.engine.destroy();
        assert!(!f.engine.is_accepting());

        let response = f.exchange(b"GET /a.txt HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }

    #[tokio::test]
    async fn test_destroy_ends_active_sessions() {
        let f = fixture();
        let backend = f.backend();
        let _backend_task = tokio::spawn(async move {
            let (stream, _) = backend.accept().await.unwrap();
            // Hold the connection open without answering
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let (mut client, server) = duplex(4096);
        let engine = f.engine.clone();
        let session = tokio::spawn(async move { engine.handle_raw_connection(server).await });
        client
            .write_all(b"GET /slow HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        f.engine.destroy();
        let result = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
