//! Incremental `multipart/mixed` reader.
//!
//! Parts are read one at a time and their bodies can be consumed in chunks,
//! so large items never have to be held in memory.

use crate::error::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt};

const FILL_SIZE: usize = 8 * 1024;
const MIN_FILL_SIZE: usize = 1024;

/// Headers of one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    pub headers: Vec<(String, String)>,
}

impl PartHeaders {
    /// First value of a header, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }
}

/// Extract the boundary parameter of a `multipart/*` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let media = params.next()?.trim();
    if !media.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Headers,
    Body,
    Finished,
}

/// Reads parts from a multipart body.
pub struct MultipartReader<R> {
    inner: R,
    boundary_line: Vec<u8>,
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    state: State,
    bytes_read: u64,
    input_done: bool,
    fill_size: usize,
}

impl<R: AsyncRead + Unpin> MultipartReader<R> {
    pub fn new(inner: R, boundary: &str) -> Self {
        Self::with_fill_size(inner, boundary, FILL_SIZE)
    }

    /// Reader pulling up to `fill_size` bytes per read, never less than 1 KiB.
    pub fn with_fill_size(inner: R, boundary: &str, fill_size: usize) -> Self {
        Self {
            inner,
            boundary_line: format!("--{}", boundary).into_bytes(),
            delimiter: format!("\r\n--{}", boundary).into_bytes(),
            buf: Vec::new(),
            state: State::Preamble,
            bytes_read: 0,
            input_done: false,
            fill_size: fill_size.max(MIN_FILL_SIZE),
        }
    }

    pub fn fill_size(&self) -> usize {
        self.fill_size
    }

    /// Raw bytes pulled from the underlying reader so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Whether the closing boundary has been read.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Whether the reader is positioned inside a part body.
    pub fn in_body(&self) -> bool {
        self.state == State::Body
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn fill(&mut self) -> Result<bool, TransportError> {
        if self.input_done {
            return Ok(false);
        }
        let start = self.buf.len();
        self.buf.resize(start + self.fill_size, 0);
        let n = self.inner.read(&mut self.buf[start..]).await?;
        self.buf.truncate(start + n);
        self.bytes_read += n as u64;
        if n == 0 {
            self.input_done = true;
        }
        Ok(n > 0)
    }

    async fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                return Ok(Some(line));
            }
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
        }
    }

    /// Classify a line that may be a boundary. Returns `Some(true)` for the
    /// closing boundary, `Some(false)` for a part boundary.
    fn boundary_kind(&self, line: &[u8]) -> Option<bool> {
        let rest = line.strip_prefix(self.boundary_line.as_slice())?;
        if rest.starts_with(b"--") {
            return Some(true);
        }
        if rest.iter().all(|b| *b == b' ' || *b == b'\t') {
            return Some(false);
        }
        None
    }

    /// Advance to the next part and return its headers, or `None` after the
    /// closing boundary. Any unread body of the current part is skipped.
    pub async fn next_part(&mut self) -> Result<Option<PartHeaders>, TransportError> {
        if self.state == State::Body {
            self.skip_body().await?;
        }

        while self.state == State::Preamble {
            let line = self.read_line().await?.ok_or_else(|| {
                TransportError::ProtocolError("multipart body ended before first boundary".to_string())
            })?;
            match self.boundary_kind(&line) {
                Some(true) => self.state = State::Finished,
                Some(false) => self.state = State::Headers,
                None => {}
            }
        }

        if self.state == State::Finished {
            return Ok(None);
        }

        let mut headers = PartHeaders::default();
        loop {
            let line = self.read_line().await?.ok_or_else(|| {
                TransportError::ProtocolError("multipart body ended inside part headers".to_string())
            })?;
            if line.is_empty() {
                break;
            }
            let line = String::from_utf8_lossy(&line);
            let (name, value) = line.split_once(':').ok_or_else(|| {
                TransportError::ProtocolError(format!("malformed part header '{}'", line))
            })?;
            headers
                .headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }

        self.state = State::Body;
        Ok(Some(headers))
    }

    /// Read the next piece of the current part body. Returns `None` at the end
    /// of the part.
    pub async fn read_body_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.state != State::Body {
            return Ok(None);
        }
        loop {
            let mut from = 0;
            while let Some(offset) = find(&self.buf[from..], &self.delimiter) {
                let pos = from + offset;
                let after = pos + self.delimiter.len();
                if self.buf.len() < after + 2 && !self.input_done {
                    break;
                }
                let next = &self.buf[after..];
                let is_boundary = next.is_empty()
                    || next.starts_with(b"--")
                    || next.starts_with(b"\r\n")
                    || matches!(next.first(), Some(b' ' | b'\t'));
                if is_boundary {
                    if pos > 0 {
                        return Ok(Some(self.buf.drain(..pos).collect()));
                    }
                    self.buf.drain(..self.delimiter.len());
                    self.finish_boundary().await?;
                    return Ok(None);
                }
                from = pos + 1;
            }

            // never emit bytes that could start a delimiter still being classified
            let keep = self.delimiter.len() + 1;
            if self.buf.len() > keep + self.fill_size || (self.input_done && self.buf.len() > keep) {
                let emit = self.buf.len() - keep;
                return Ok(Some(self.buf.drain(..emit).collect()));
            }

            if !self.fill().await? && self.buf.len() <= keep {
                return Err(TransportError::ProtocolError(
                    "multipart body ended inside a part".to_string(),
                ));
            }
        }
    }

    async fn finish_boundary(&mut self) -> Result<(), TransportError> {
        while self.buf.len() < 2 {
            if !self.fill().await? {
                break;
            }
        }
        if self.buf.starts_with(b"--") {
            self.state = State::Finished;
            self.buf.drain(..2);
        } else {
            self.state = State::Headers;
        }
        // remainder of the boundary line (transport padding and CRLF)
        self.read_line().await?;
        Ok(())
    }

    /// Read the rest of the current part body into memory.
    pub async fn read_body_to_end(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.read_body_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Discard the rest of the current part body.
    pub async fn skip_body(&mut self) -> Result<(), TransportError> {
        while self.read_body_chunk().await?.is_some() {}
        Ok(())
    }

    /// Consume everything up to the end of the underlying input.
    pub async fn drain(&mut self) -> Result<(), TransportError> {
        while self.next_part().await?.is_some() {}
        self.buf.clear();
        while self.fill().await? {
            self.buf.clear();
        }
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
