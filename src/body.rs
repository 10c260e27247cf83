use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use http::HeaderMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::HttpLimits;
use crate::errors::{Error, Result};

/// A fully buffered message body.
///
/// Bodies are read off the wire once, then both relayed and captured, so they
/// live in an owned buffer instead of a stream.
#[derive(Clone, PartialEq)]
pub struct Body {
  inner: Bytes,
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl Default for Body {
  fn default() -> Self {
    Self {
      inner: Bytes::new(),
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Display::fmt(&String::from_utf8_lossy(&self.inner), f)
  }
}

impl serde::Serialize for Body {
  fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&String::from_utf8_lossy(&self.inner))
  }
}

/// How the length of a message body was delimited on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
  /// no body
  #[default]
  Empty,
  /// `Content-Length`
  Length,
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// read until the peer closed the connection
  Eof,
}

impl Framing {
  /// Framings whose original delimiter is lost once the body is buffered.
  pub(crate) fn needs_content_length(&self) -> bool {
    matches!(self, Framing::Chunked | Framing::Eof)
  }
}

/// Read one `\n`-terminated line, at most `limit` bytes long.
///
/// Returns `0` when the stream ends before any byte of the line was read,
/// whether the peer closed cleanly or dropped TLS without close_notify. A
/// stream ending inside the line is a protocol error.
pub(crate) async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let start = buf.len();
  let n = match (&mut *reader)
    .take(limit as u64)
    .read_until(b'\n', buf)
    .await
  {
    Ok(n) => n,
    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
      if buf.len() > start {
        return Err(Error::protocol("unexpected end of stream inside a line"));
      }
      0
    }
    Err(err) => return Err(Error::IO(err)),
  };
  if n > 0 && !buf.ends_with(b"\n") {
    return Err(if n >= limit {
      Error::protocol(format!("line exceeds {limit} bytes"))
    } else {
      Error::protocol("unexpected end of stream inside a line")
    });
  }
  Ok(n)
}

/// Value of `Content-Length`; every occurrence has to agree.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all(http::header::CONTENT_LENGTH) {
    let value = value
      .to_str()
      .map_err(|_| Error::protocol("non-ascii content-length"))?;
    for part in value.split(',') {
      let parsed: u64 = part
        .trim()
        .parse()
        .map_err(|_| Error::protocol(format!("invalid content-length {part:?}")))?;
      match length {
        Some(previous) if previous != parsed => {
          return Err(Error::protocol("conflicting content-length values"));
        }
        _ => length = Some(parsed),
      }
    }
  }
  Ok(length)
}

/// Whether `Transfer-Encoding` is present, and whether its final coding is chunked.
pub(crate) fn transfer_encoding(headers: &HeaderMap) -> (bool, bool) {
  let mut present = false;
  let mut last = String::new();
  for value in headers.get_all(http::header::TRANSFER_ENCODING) {
    present = true;
    if let Some(coding) = value
      .to_str()
      .ok()
      .and_then(|v| v.split(',').map(str::trim).filter(|c| !c.is_empty()).last())
    {
      last = coding.to_ascii_lowercase();
    }
  }
  (present, last == "chunked")
}

fn truncated(err: std::io::Error) -> Error {
  if err.kind() == std::io::ErrorKind::UnexpectedEof {
    Error::protocol("unexpected end of stream inside a body")
  } else {
    Error::IO(err)
  }
}

pub(crate) async fn read_sized<R>(reader: &mut R, length: u64, limits: &HttpLimits) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  if length > limits.max_body_size as u64 {
    return Err(Error::protocol(format!(
      "body of {length} bytes exceeds limit of {}",
      limits.max_body_size
    )));
  }
  let mut body = vec![0; length as usize];
  reader.read_exact(&mut body).await.map_err(truncated)?;
  Ok(body)
}

pub(crate) async fn read_chunked<R>(reader: &mut R, limits: &HttpLimits) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line(reader, &mut line, limits.max_header_size).await? == 0 {
      return Err(Error::protocol("unexpected end of stream inside a chunked body"));
    }
    let text = String::from_utf8_lossy(&line);
    // chunk extensions are ignored
    let size = text.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size, 16)
      .map_err(|_| Error::protocol(format!("invalid chunk size {size:?}")))?;
    if size == 0 {
      break;
    }
    if body.len().saturating_add(size) > limits.max_body_size {
      return Err(Error::protocol(format!(
        "chunked body exceeds limit of {}",
        limits.max_body_size
      )));
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader
      .read_exact(&mut body[start..])
      .await
      .map_err(truncated)?;
    line.clear();
    read_line(reader, &mut line, limits.max_header_size).await?;
    if line != b"\r\n" && line != b"\n" {
      return Err(Error::protocol("missing CRLF after chunk data"));
    }
  }
  // trailers are read and dropped
  let mut trailer_bytes = 0;
  loop {
    line.clear();
    let n = read_line(reader, &mut line, limits.max_header_size).await?;
    trailer_bytes += n;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    if trailer_bytes > limits.max_header_size {
      return Err(Error::protocol("chunked trailers too large"));
    }
  }
  Ok(body)
}

pub(crate) async fn read_until_eof<R>(reader: &mut R, limits: &HttpLimits) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  match (&mut *reader)
    .take(limits.max_body_size as u64 + 1)
    .read_to_end(&mut body)
    .await
  {
    Ok(_) => {}
    // TLS peers frequently close without close_notify; what was read is the body
    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {}
    Err(err) => return Err(Error::IO(err)),
  }
  if body.len() > limits.max_body_size {
    return Err(Error::protocol(format!(
      "body exceeds limit of {}",
      limits.max_body_size
    )));
  }
  Ok(body)
}
