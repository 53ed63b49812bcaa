//! Minimal HTTP/1.x message handling
//! The relay parses heads to route and frame messages; bodies stay raw bytes
//! and are forwarded exactly as framed on the wire.

use crate::error::{GatewayError, Result};
use bytes::BytesMut;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request head accepted before the connection is dropped
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Parsed request line and header block
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Parse a request head from the front of `buf`.
    /// Returns the head and the number of bytes it occupied, or `None` if
    /// the head is not complete yet.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let consumed = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(GatewayError::Relay(format!("malformed request head: {e}"))),
        };

        let method = Method::from_bytes(req.method.unwrap_or("GET").as_bytes())
            .map_err(|e| GatewayError::Relay(format!("invalid method: {e}")))?;
        let path = req.path.unwrap_or("/").to_string();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut map = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| GatewayError::Relay(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| GatewayError::Relay(format!("invalid header value: {e}")))?;
            map.append(name, value);
        }

        Ok(Some((
            Self {
                method,
                path,
                version,
                headers: map,
            },
            consumed,
        )))
    }

    /// Host header, lowercased and without port
    pub fn host(&self) -> Option<String> {
        self.headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
    }

    /// Check if request is WebSocket upgrade
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Whether the client allows another request on this connection
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// How the request body is delimited. Requests without a length or
    /// chunked coding carry no body.
    pub fn body_framing(&self) -> Result<BodyFraming> {
        Ok(header_framing(&self.headers)?.unwrap_or(BodyFraming::Empty))
    }

    /// Literal request line and header block, as written to a backend
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        out.push(b' ');
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Status line and headers of a backend response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Parse a response head from the front of `buf`, like
    /// [`RequestHead::parse`]
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);

        let consumed = match res.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(GatewayError::Relay(format!("malformed response head: {e}"))),
        };

        let version = match res.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut map = HeaderMap::with_capacity(res.headers.len());
        for header in res.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| GatewayError::Relay(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| GatewayError::Relay(format!("invalid header value: {e}")))?;
            map.append(name, value);
        }

        Ok(Some((
            Self {
                status: res.code.unwrap_or(0),
                version,
                headers: map,
            },
            consumed,
        )))
    }

    /// 1xx responses precede the final one
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// How the body of this response to a `request_method` request is
    /// delimited
    pub fn body_framing(&self, request_method: &Method) -> Result<BodyFraming> {
        if *request_method == Method::HEAD || self.is_interim() || self.status == 204 || self.status == 304 {
            return Ok(BodyFraming::Empty);
        }
        Ok(header_framing(&self.headers)?.unwrap_or(BodyFraming::UntilClose))
    }
}

/// Message body delimitation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the sender closes the connection
    UntilClose,
}

fn header_framing(headers: &HeaderMap) -> Result<Option<BodyFraming>> {
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if chunked {
        return Ok(Some(BodyFraming::Chunked));
    }

    match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|n| Some(BodyFraming::Length(n)))
            .ok_or_else(|| GatewayError::Relay(format!("invalid content-length {value:?}"))),
        None => Ok(None),
    }
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    if has_token("close") {
        false
    } else if version == Version::HTTP_10 {
        has_token("keep-alive")
    } else {
        true
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Read the next request head on a connection.
///
/// `buf` carries bytes already read from the connection; the head is taken
/// off its front and anything past it (a body, or pipelined requests) stays
/// there. Returns `None` when the peer closes between requests.
pub async fn read_head<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            if let Some((head, consumed)) = RequestHead::parse(&buf[..])? {
                let _ = buf.split_to(consumed);
                return Ok(Some(head));
            }
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(GatewayError::Relay(format!(
                "request head exceeds {MAX_HEAD_SIZE} bytes"
            )));
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(GatewayError::Relay(
                "connection closed before the request head was complete".to_string(),
            ));
        }
    }
}

/// Read a response head, returning it with its raw bytes. Bytes past the
/// head stay in `buf`.
pub async fn read_response_head<R>(reader: &mut R, buf: &mut BytesMut) -> Result<(ResponseHead, BytesMut)>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            if let Some((head, consumed)) = ResponseHead::parse(&buf[..])? {
                return Ok((head, buf.split_to(consumed)));
            }
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(GatewayError::Relay(format!(
                "response head exceeds {MAX_HEAD_SIZE} bytes"
            )));
        }
        fill(reader, buf).await?;
    }
}

/// Copy one body framed as `framing` from `buf` then `reader` to `writer`,
/// byte for byte. Whatever follows the body stays in `buf`.
pub async fn forward_body<R, W>(framing: BodyFraming, buf: &mut BytesMut, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(n) => copy_exact(n, buf, reader, writer).await,
        BodyFraming::Chunked => forward_chunked(buf, reader, writer).await,
        BodyFraming::UntilClose => {
            if !buf.is_empty() {
                writer.write_all(&buf.split()).await?;
            }
            tokio::io::copy(reader, writer).await?;
            Ok(())
        }
    }
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<()> {
    if reader.read_buf(buf).await? == 0 {
        return Err(GatewayError::Relay("connection closed in the middle of a message".to_string()));
    }
    Ok(())
}

async fn copy_exact<R, W>(mut remaining: u64, buf: &mut BytesMut, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while remaining > 0 {
        if buf.is_empty() {
            fill(reader, buf).await?;
        }
        let take = remaining.min(buf.len() as u64) as usize;
        writer.write_all(&buf.split_to(take)).await?;
        remaining -= take as u64;
    }
    Ok(())
}

async fn forward_chunked<R, W>(buf: &mut BytesMut, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (line_len, size) = loop {
            match httparse::parse_chunk_size(&buf[..]) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD_SIZE => fill(reader, buf).await?,
                _ => return Err(GatewayError::Relay("invalid chunk size line".to_string())),
            }
        };
        writer.write_all(&buf.split_to(line_len)).await?;

        if size == 0 {
            // Trailer fields, then the empty line that ends the body
            loop {
                let line = read_line(reader, buf).await?;
                writer.write_all(&line).await?;
                if &line[..] == b"\r\n" {
                    return Ok(());
                }
            }
        }

        let data = size
            .checked_add(2)
            .ok_or_else(|| GatewayError::Relay("chunk size out of range".to_string()))?;
        copy_exact(data, buf, reader, writer).await?;
    }
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<BytesMut> {
    loop {
        if let Some(end) = buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(buf.split_to(end + 2));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(GatewayError::Relay("trailer line too long".to_string()));
        }
        fill(reader, buf).await?;
    }
}

/// Small text response that closes the connection
pub fn plain_response(status: StatusCode, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
    .into_bytes()
}
