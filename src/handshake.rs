//! WebSocket upgrade handshakes (RFC 6455), for both the inbound client and
//! the backend. Framing is not handled here: once both sides are upgraded the
//! relay becomes a byte pipe.

use crate::error::{GatewayError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use hyper::HeaderMap;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// WebSocket magic GUID for Sec-WebSocket-Accept calculation
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Subprotocols the gateway agrees to on behalf of its backends
pub const SUPPORTED_PROTOCOLS: &[&str] = &["wamp", "json"];

/// Upper bound on the backend's handshake response
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Compute Sec-WebSocket-Accept value from client key
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Pick the first offered subprotocol that is also supported.
/// Offers are separated by commas and/or spaces.
pub fn negotiate_protocol<'a>(offered: &str, supported: &[&'a str]) -> Option<&'a str> {
    offered
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .find_map(|p| supported.iter().copied().find(|s| *s == p))
}

/// Outcome of the inbound (server side) handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub accept: String,
    pub protocol: Option<String>,
}

impl ServerHandshake {
    /// The literal `101` response sent to the client
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut response = String::from("HTTP/1.1 101 Switching Protocols\r\n");
        response.push_str("Upgrade: websocket\r\n");
        response.push_str("Connection: Upgrade\r\n");
        response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", self.accept));
        if let Some(protocol) = &self.protocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        response.push_str("\r\n");
        response.into_bytes()
    }
}

/// Negotiate the inbound side of an upgrade from the client's headers
pub fn server_handshake(headers: &HeaderMap) -> Result<ServerHandshake> {
    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| GatewayError::Handshake("missing Sec-WebSocket-Key".to_string()))?;

    let offered = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(",");

    let protocol = if offered.is_empty() {
        None
    } else {
        let chosen = negotiate_protocol(&offered, SUPPORTED_PROTOCOLS);
        if chosen.is_none() {
            info!(offered = %offered, "client offered no supported websocket subprotocol");
        }
        chosen.map(str::to_string)
    };

    Ok(ServerHandshake {
        accept: compute_accept(key),
        protocol,
    })
}

/// Outcome of the backend (client side) handshake
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    /// The key sent to the backend
    pub key: String,
    /// The backend's Sec-WebSocket-Accept value, unverified
    pub accept: String,
    /// Bytes the backend sent after its header block
    pub leftover: Bytes,
}

/// Upgrade a backend connection.
///
/// Caller headers are forwarded except `connection`, `upgrade` and
/// `sec-websocket-key`, which are generated here. The backend must answer
/// with a `Sec-WebSocket-Accept` header; its value is not checked against
/// the key we sent.
pub async fn client_handshake<S>(path: &str, backend: &mut S, headers: &HeaderMap) -> Result<ClientHandshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = STANDARD.encode(rand::random::<[u8; 16]>());

    let mut request = format!("GET {path} HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n").into_bytes();
    for (name, value) in headers.iter() {
        if name == CONNECTION || name == UPGRADE || name == SEC_WEBSOCKET_KEY {
            continue;
        }
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(format!("Sec-WebSocket-Key: {key}\r\n\r\n").as_bytes());

    backend.write_all(&request).await?;
    backend.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((accept, consumed)) = parse_backend_response(&buf)? {
            let leftover = buf.split_off(consumed).freeze();
            debug!(path, "backend accepted websocket upgrade");
            return Ok(ClientHandshake { key, accept, leftover });
        }

        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(GatewayError::Handshake(
                "backend handshake response too large".to_string(),
            ));
        }

        if backend.read_buf(&mut buf).await? == 0 {
            return Err(GatewayError::Handshake(
                "backend closed the connection during the websocket handshake".to_string(),
            ));
        }
    }
}

fn parse_backend_response(buf: &[u8]) -> Result<Option<(String, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);

    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(GatewayError::Handshake(format!(
                "malformed backend handshake response: {e}"
            )))
        }
    };

    let accept = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string());

    match accept {
        Some(accept) => Ok(Some((accept, consumed))),
        None => Err(GatewayError::Handshake(format!(
            "backend does not support websockets (status {})",
            response.code.unwrap_or_default()
        ))),
    }
}
