//! Minimal HTTP/1.1 framing for the request protocol.
//!
//! Requests are encoded into a byte buffer and written in one go. Responses
//! are read as a head followed by a [`BodyReader`] that understands
//! `Content-Length`, chunked and connection-delimited bodies.

use crate::error::TransportError;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, ReadBuf};

/// Value sent in the `User-Agent` header.
pub const USER_AGENT: &str = concat!("xcc-rs/", env!("CARGO_PKG_VERSION"));

/// Media types the driver understands in responses.
pub const ACCEPT: &str = "application/x-xcc-sequence, multipart/mixed";

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// How the request body is framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// No body
    Empty,
    /// Body sent with `Content-Length`
    Fixed(Vec<u8>),
    /// Body of a known length written after the head
    Sized(u64),
    /// Body follows the head as chunks
    Chunked,
}

/// An HTTP request ready to be written.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: &'static str,
    /// Path including any query string
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn post(target: impl Into<String>) -> Self {
        Self {
            method: "POST",
            target: target.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Encode the request line, headers and any fixed body.
    pub fn encode(&self, host: &str) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, self.target, host);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        match &self.body {
            RequestBody::Empty => out.push_str("Content-Length: 0\r\n"),
            RequestBody::Fixed(body) => {
                out.push_str(&format!("Content-Length: {}\r\n", body.len()))
            }
            RequestBody::Sized(len) => out.push_str(&format!("Content-Length: {}\r\n", len)),
            RequestBody::Chunked => out.push_str("Transfer-Encoding: chunked\r\n"),
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        if let RequestBody::Fixed(body) = &self.body {
            bytes.extend_from_slice(body);
        }
        bytes
    }
}

/// Frame one chunk of a chunked request body. Empty input yields the final chunk.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// One `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub max_age: Option<i64>,
}

impl SetCookie {
    /// Parse `name=value; Max-Age=0; Path=/`.
    pub fn parse(header: &str) -> Option<Self> {
        let mut attributes = header.split(';');
        let (name, value) = attributes.next()?.split_once('=')?;
        let max_age = attributes
            .filter_map(|attr| attr.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("max-age"))
            .and_then(|(_, v)| v.trim().parse().ok());
        Some(Self {
            name: name.trim().to_string(),
            value: value.trim().trim_matches('"').to_string(),
            max_age,
        })
    }

    /// A cookie that deletes its value.
    pub fn is_expired(&self) -> bool {
        self.value.is_empty() || self.max_age.is_some_and(|age| age <= 0)
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Whether the server asked to close the connection after this response.
    pub fn connection_close(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("close"))
    }

    /// `timeout=` value of the `Keep-Alive` header.
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.header("Keep-Alive")?
            .split(',')
            .filter_map(|part| part.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("timeout"))
            .and_then(|(_, v)| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn set_cookies(&self) -> Vec<SetCookie> {
        self.header_all("Set-Cookie").filter_map(SetCookie::parse).collect()
    }

    pub fn server(&self) -> Option<&str> {
        self.header("Server")
    }

    /// How the body following this head is delimited.
    pub fn framing(&self) -> BodyFraming {
        if self.status == 204 || self.status == 304 {
            BodyFraming::Length(0)
        } else if self.is_chunked() {
            BodyFraming::Chunked
        } else if let Some(len) = self.content_length() {
            BodyFraming::Length(len)
        } else {
            BodyFraming::UntilClose
        }
    }
}

/// Read the status line and headers.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut line = String::new();

    let status_line = loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(TransportError::ReceiveError(
                "connection closed before response".to_string(),
            ));
        }
        total += n;
        // tolerate stray blank lines between pipelined responses
        if !line.trim().is_empty() {
            break line.trim_end().to_string();
        }
    };

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransportError::ProtocolError(format!(
            "malformed status line '{}'",
            status_line
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::ProtocolError(format!("malformed status line '{}'", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(TransportError::ReceiveError(
                "connection closed inside response head".to_string(),
            ));
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(TransportError::ProtocolError("response head too large".to_string()));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed.split_once(':').ok_or_else(|| {
            TransportError::ProtocolError(format!("malformed header line '{}'", trimmed))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Body delimitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug)]
enum ChunkState {
    Size(Vec<u8>),
    Data(u64),
    DataEnd(Vec<u8>),
    Trailer(Vec<u8>),
}

#[derive(Debug)]
enum BodyState {
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
    Done,
}

/// Reads exactly one response body from `R` and then reports end of stream.
pub struct BodyReader<R> {
    inner: R,
    state: BodyState,
    until_close: bool,
    bytes_read: u64,
}

impl<R> BodyReader<R> {
    pub fn new(inner: R, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Length(0) => BodyState::Done,
            BodyFraming::Length(n) => BodyState::Length(n),
            BodyFraming::Chunked => BodyState::Chunked(ChunkState::Size(Vec::new())),
            BodyFraming::UntilClose => BodyState::UntilClose,
        };
        Self {
            inner,
            state,
            until_close: framing == BodyFraming::UntilClose,
            bytes_read: 0,
        }
    }

    /// Whether the whole body has been consumed.
    pub fn is_done(&self) -> bool {
        matches!(self.state, BodyState::Done)
    }

    /// Whether the underlying stream can carry another response afterwards.
    pub fn is_reusable(&self) -> bool {
        self.is_done() && !self.until_close
    }

    /// Payload bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn unexpected_eof(context: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("connection closed {}", context),
    )
}

/// Accumulate one `\n`-terminated line into `line`.
fn poll_line<R: AsyncBufRead + Unpin>(
    inner: &mut R,
    cx: &mut Context<'_>,
    line: &mut Vec<u8>,
) -> Poll<io::Result<()>> {
    loop {
        let available = ready!(Pin::new(&mut *inner).poll_fill_buf(cx))?;
        if available.is_empty() {
            return Poll::Ready(Err(unexpected_eof("inside chunked body")));
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&available[..=pos]);
                Pin::new(&mut *inner).consume(pos + 1);
                return Poll::Ready(Ok(()));
            }
            None => {
                let n = available.len();
                line.extend_from_slice(available);
                Pin::new(&mut *inner).consume(n);
                if line.len() > MAX_HEAD_BYTES {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "chunk framing line too long",
                    )));
                }
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line"))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("invalid chunk size '{}'", size)))
}

impl<R: AsyncBufRead + Unpin> AsyncRead for BodyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                BodyState::Done => return Poll::Ready(Ok(())),
                BodyState::Length(remaining) => {
                    let available = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
                    if available.is_empty() {
                        return Poll::Ready(Err(unexpected_eof("inside response body")));
                    }
                    let n = available
                        .len()
                        .min(buf.remaining())
                        .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    buf.put_slice(&available[..n]);
                    Pin::new(&mut this.inner).consume(n);
                    *remaining -= n as u64;
                    this.bytes_read += n as u64;
                    if *remaining == 0 {
                        this.state = BodyState::Done;
                    }
                    return Poll::Ready(Ok(()));
                }
                BodyState::UntilClose => {
                    let available = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
                    if available.is_empty() {
                        this.state = BodyState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    let n = available.len().min(buf.remaining());
                    buf.put_slice(&available[..n]);
                    Pin::new(&mut this.inner).consume(n);
                    this.bytes_read += n as u64;
                    return Poll::Ready(Ok(()));
                }
                BodyState::Chunked(chunk) => match chunk {
                    ChunkState::Size(line) => {
                        ready!(poll_line(&mut this.inner, cx, line))?;
                        let size = parse_chunk_size(line)?;
                        *chunk = if size == 0 {
                            ChunkState::Trailer(Vec::new())
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    ChunkState::Data(remaining) => {
                        let available = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
                        if available.is_empty() {
                            return Poll::Ready(Err(unexpected_eof("inside chunk")));
                        }
                        let n = available
                            .len()
                            .min(buf.remaining())
                            .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                        buf.put_slice(&available[..n]);
                        Pin::new(&mut this.inner).consume(n);
                        *remaining -= n as u64;
                        this.bytes_read += n as u64;
                        if *remaining == 0 {
                            *chunk = ChunkState::DataEnd(Vec::new());
                        }
                        return Poll::Ready(Ok(()));
                    }
                    ChunkState::DataEnd(line) => {
                        ready!(poll_line(&mut this.inner, cx, line))?;
                        *chunk = ChunkState::Size(Vec::new());
                    }
                    ChunkState::Trailer(line) => {
                        ready!(poll_line(&mut this.inner, cx, line))?;
                        if line.iter().all(|b| b.is_ascii_whitespace()) {
                            this.state = BodyState::Done;
                        } else {
                            line.clear();
                        }
                    }
                },
            }
        }
    }
}
