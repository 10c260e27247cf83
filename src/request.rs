use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::body::{content_length, read_chunked, read_line, read_sized, transfer_encoding};
use crate::body::{Body, Framing};
use crate::config::HttpLimits;
use crate::errors::{Error, Result};
use crate::headers::read_header_block;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A request read from a proxy client.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  framing: Framing,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      framing: if body.is_empty() {
        Framing::Empty
      } else {
        Framing::Length
      },
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serialize in origin-form for the upstream leg.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    let path = self.uri.path();
    http_requests.extend(if path.is_empty() { "/" } else { path }.as_bytes());
    if let Some(q) = self.uri.query() {
      http_requests.extend([63]);
      http_requests.extend(q.as_bytes());
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(http::header::HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(authority.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    let mut headers = self.headers.clone();
    let length = self.body().map(|b| b.len()).unwrap_or_default();
    if self.framing.needs_content_length() {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(length));
    } else if length > 0 {
      headers
        .entry(http::header::CONTENT_LENGTH)
        .or_insert(HeaderValue::from(length));
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_requests.extend(b.as_ref());
      }
    }
    Bytes::from(http_requests)
  }
  /// Creates a new builder-style object to manufacture a `Request`
  ///
  /// # Examples
  ///
  /// ```
  /// let request: mitm_proxy::Request = mitm_proxy::Request::builder()
  ///     .method("GET")
  ///     .uri("http://example.com/")
  ///     .header("X-Custom-Foo", "Bar")
  ///     .body(())
  ///     .unwrap()
  ///     .map(|_| mitm_proxy::Body::default())
  ///     .into();
  /// assert_eq!(request.uri().host(), Some("example.com"));
  /// ```
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// The request method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// The request target as it appeared on the request line.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Request headers, in arrival order.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Mutable access to the request headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Decoded request body, `None` when the request carried no payload.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Protocol version from the request line.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// How the body was delimited on the client leg.
  #[inline]
  pub fn framing(&self) -> Framing {
    self.framing
  }
  /// Declared `Content-Length`, if any.
  pub fn content_length(&self) -> Option<u64> {
    content_length(&self.headers).ok().flatten()
  }
  /// Whether the client asked for the connection to close after this exchange.
  pub(crate) fn wants_close(&self) -> bool {
    let close = self
      .headers
      .get_all(http::header::CONNECTION)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case("close"));
    close || self.version == Version::HTTP_10
  }
}

/// Reads requests off a buffered client stream.
///
/// The reader is borrowed so that several requests can be parsed from one
/// connection without losing buffered bytes between them.
pub struct RequestParser<'a, R> {
  reader: &'a mut R,
  limits: HttpLimits,
}

impl<'a, R> RequestParser<'a, R>
where
  R: AsyncBufRead + Unpin,
{
  /// Parser over `reader` enforcing `limits`.
  pub fn new(reader: &'a mut R, limits: HttpLimits) -> Self {
    RequestParser { reader, limits }
  }

  /// Read the request line; `None` on a clean close before the first byte.
  async fn parser_request_line(&mut self) -> Result<Option<(Method, http::Uri, Version, usize)>> {
    let mut line = Vec::new();
    let mut consumed = 0;
    loop {
      line.clear();
      let remaining = self.limits.max_header_size.saturating_sub(consumed);
      let length = read_line(self.reader, &mut line, remaining).await?;
      if length == 0 {
        if consumed == 0 {
          return Ok(None);
        }
        return Err(Error::protocol("unexpected end of stream before request line"));
      }
      consumed += length;
      // stray empty lines ahead of a request are skipped
      if line != b"\r\n" && line != b"\n" {
        break;
      }
    }
    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    let mut parts = trimmed.split(|b| b == &b' ').filter(|p| !p.is_empty());
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v), None) => (m, t, v),
      _ => {
        return Err(Error::protocol(format!(
          "malformed request line {:?}",
          String::from_utf8_lossy(trimmed)
        )))
      }
    };
    let method = Method::from_bytes(method).map_err(|e| Error::Http(e.into()))?;
    let uri = http::Uri::try_from(target).map_err(|e| Error::Http(e.into()))?;
    let version = match version {
      b"HTTP/1.0" => Version::HTTP_10,
      b"HTTP/1.1" => Version::HTTP_11,
      other => {
        return Err(Error::protocol(format!(
          "unsupported version {:?}",
          String::from_utf8_lossy(other)
        )))
      }
    };
    Ok(Some((method, uri, version, consumed)))
  }

  async fn read_body(&mut self, headers: &HeaderMap) -> Result<(Option<Body>, Framing)> {
    let (has_te, chunked) = transfer_encoding(headers);
    let (body, framing) = if has_te {
      if !chunked {
        return Err(Error::protocol(
          "request transfer-encoding does not end in chunked",
        ));
      }
      (read_chunked(self.reader, &self.limits).await?, Framing::Chunked)
    } else if let Some(length) = content_length(headers)? {
      (
        read_sized(self.reader, length, &self.limits).await?,
        Framing::Length,
      )
    } else {
      (Vec::new(), Framing::Empty)
    };
    let body = if body.is_empty() {
      None
    } else {
      Some(Body::from(body))
    };
    Ok((body, framing))
  }

  /// Read one complete request, or `None` if the client closed cleanly.
  pub async fn parse(mut self) -> Result<Option<Request>> {
    let Some((method, uri, version, consumed)) = self.parser_request_line().await? else {
      return Ok(None);
    };
    let headers = read_header_block(self.reader, self.limits.max_header_size, consumed).await?;
    let (body, framing) = if method == Method::CONNECT {
      (None, Framing::Empty)
    } else {
      self.read_body(&headers).await?
    };
    Ok(Some(Request {
      uri,
      version,
      method,
      headers,
      body,
      framing,
    }))
  }
}
