//! Header line parsing and hop-by-hop header handling.
use http::header::CONNECTION;
use http::{HeaderMap, HeaderName};

use tokio::io::AsyncBufRead;

use crate::body::read_line;
use crate::errors::{Error, Result};
use crate::{CR_LF, SPACE};

/// Headers that only describe one transport leg and are never relayed.
pub const HOP_BY_HOP: &[&str] = &[
  "proxy-connection",
  "connection",
  "keep-alive",
  "transfer-encoding",
  "te",
  "trailer",
  "upgrade",
  "proxy-authenticate",
  "proxy-authorization",
];

/// Remove hop-by-hop headers, including every header listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(*name);
  }
}

/// Parse one `name: value` header line.
pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |s| s == &b':');
  let (name, value) = match (parts.next(), parts.next()) {
    (Some(name), Some(value)) => (name, value),
    _ => {
      return Err(Error::protocol(format!(
        "malformed header line {:?}",
        String::from_utf8_lossy(buffer)
      )))
    }
  };
  let name = http::HeaderName::from_bytes(name).map_err(|e| Error::Http(e.into()))?;
  let value = value.strip_prefix(SPACE).unwrap_or(value);
  let value = value.trim_ascii();
  let value = http::HeaderValue::from_bytes(value).map_err(|e| Error::Http(e.into()))?;
  Ok((name, value))
}

/// Read header lines up to the blank line ending the head.
///
/// `consumed` is the size of the start line already read, counted against
/// `limit` together with the header lines.
pub(crate) async fn read_header_block<R>(
  reader: &mut R,
  limit: usize,
  consumed: usize,
) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = consumed;
  loop {
    header_line.clear();
    let remaining = limit.saturating_sub(total);
    if remaining == 0 {
      return Err(Error::protocol(format!("message head exceeds {limit} bytes")));
    }
    let length = read_line(reader, &mut header_line, remaining).await?;
    if length == 0 {
      return Err(Error::protocol("unexpected end of stream inside headers"));
    }
    total += length;
    if header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}
