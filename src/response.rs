use std::fmt::Debug;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Method, Response as HttpResponse, StatusCode};
use tokio::io::AsyncBufRead;

use crate::body::{content_length, read_chunked, read_line, read_sized, read_until_eof};
use crate::body::{transfer_encoding, Body, Framing};
use crate::config::HttpLimits;
use crate::cookies;
use crate::errors::{Error, Result};
use crate::headers::{read_header_block, strip_hop_by_hop};
use crate::{Request, COLON_SPACE, CR_LF, SPACE};

/// A response read from an origin server.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  status_code: StatusCode,
  reason: Option<String>,
  headers: http::HeaderMap<HeaderValue>,
  body: Option<Body>,
  framing: Framing,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      reason: None,
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

impl Response {
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.reason().as_bytes());
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_response.extend(b.as_ref());
      }
    }
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// The empty `502 Bad Gateway` sent when the origin could not be reached.
  pub fn bad_gateway() -> Response {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(0));
    Response {
      version: http::Version::HTTP_11,
      status_code: StatusCode::BAD_GATEWAY,
      headers,
      ..Response::default()
    }
  }
  /// Make the response fit for the client leg.
  ///
  /// Hop-by-hop headers are removed, and a body whose length was given by
  /// chunking or connection close gets an explicit `Content-Length`.
  pub(crate) fn prepare_for_relay(&mut self) {
    strip_hop_by_hop(&mut self.headers);
    if self.framing.needs_content_length() {
      let length = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
      self
        .headers
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from(length));
    }
  }
}

impl Response {
  /// Retrieve the cookies set by the response.
  pub fn cookies(&self) -> impl Iterator<Item = cookies::Cookie<'_>> + '_ {
    cookies::extract_response_cookies(&self.headers).filter_map(|c| c.ok())
  }
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Reason phrase sent by the origin, or the canonical one.
  pub fn reason(&self) -> &str {
    match &self.reason {
      Some(reason) => reason.as_str(),
      None => self.status_code.canonical_reason().unwrap_or_default(),
    }
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    content_length(&self.headers).ok().flatten()
  }
  /// Get the full response body.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// How the body was delimited by the origin.
  pub fn framing(&self) -> Framing {
    self.framing
  }
}

/// A builder reading a `Response` off an upstream stream.
pub struct ResponseBuilder<'a, R> {
  reader: &'a mut R,
  config: ResponseConfig,
}

/// response config
#[derive(Debug, Clone, Default)]
pub struct ResponseConfig {
  method: Method,
  timeout: Option<Duration>,
  limits: HttpLimits,
}

impl ResponseConfig {
  /// Config for the response to `request`.
  pub fn new(request: &Request, timeout: Option<Duration>, limits: HttpLimits) -> Self {
    ResponseConfig {
      method: request.method().clone(),
      timeout,
      limits,
    }
  }
}

impl<'a, R> ResponseBuilder<'a, R>
where
  R: AsyncBufRead + Unpin,
{
  /// Constructs a new response.
  pub fn new(reader: &'a mut R, config: ResponseConfig) -> ResponseBuilder<'a, R> {
    ResponseBuilder { reader, config }
  }

  async fn parser_version(&mut self) -> Result<(http::Version, StatusCode, Option<String>, usize)> {
    let mut line = Vec::new();
    let length = read_line(self.reader, &mut line, self.config.limits.max_header_size).await?;
    if length == 0 {
      return Err(Error::protocol("origin closed before sending a status line"));
    }
    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    let mut parts = trimmed.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      _ => {
        return Err(Error::protocol(format!(
          "invalid status line {:?}",
          String::from_utf8_lossy(trimmed)
        )));
      }
    };
    let status = parts
      .next()
      .ok_or_else(|| Error::protocol("status line without a status code"))?;
    let status = StatusCode::from_bytes(status).map_err(|x| Error::Http(http::Error::from(x)))?;
    let reason = parts
      .next()
      .map(|r| String::from_utf8_lossy(r).trim().to_string())
      .filter(|r| !r.is_empty());
    Ok((version, status, reason, length))
  }

  async fn read_body(
    &mut self,
    status: StatusCode,
    headers: &http::HeaderMap,
  ) -> Result<(Vec<u8>, Framing)> {
    if self.config.method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok((Vec::new(), Framing::Empty));
    }
    let limits = self.config.limits;
    let (has_te, chunked) = transfer_encoding(headers);
    if has_te {
      if chunked {
        return Ok((read_chunked(self.reader, &limits).await?, Framing::Chunked));
      }
      return Ok((read_until_eof(self.reader, &limits).await?, Framing::Eof));
    }
    match content_length(headers)? {
      Some(0) => Ok((Vec::new(), Framing::Empty)),
      Some(length) => Ok((read_sized(self.reader, length, &limits).await?, Framing::Length)),
      None => Ok((read_until_eof(self.reader, &limits).await?, Framing::Eof)),
    }
  }

  async fn read_response(&mut self) -> Result<Response> {
    loop {
      let (version, status_code, reason, consumed) = self.parser_version().await?;
      let headers = read_header_block(
        self.reader,
        self.config.limits.max_header_size,
        consumed,
      )
      .await?;
      // interim responses are consumed; only the final one is relayed
      if status_code.is_informational() && status_code != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(status = status_code.as_u16(), "skipping interim response");
        continue;
      }
      let (body, framing) = self.read_body(status_code, &headers).await?;
      return Ok(Response {
        version,
        status_code,
        reason,
        headers,
        body: if body.is_empty() {
          None
        } else {
          Some(Body::from(body))
        },
        framing,
      });
    }
  }

  /// Read the final response, bounded by the configured read timeout.
  pub async fn build(mut self) -> Result<Response> {
    match self.config.timeout {
      Some(timeout) => tokio::time::timeout(timeout, self.read_response())
        .await
        .map_err(|_| {
          Error::IO(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out reading response",
          ))
        })?,
      None => self.read_response().await,
    }
  }
}
