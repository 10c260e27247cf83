//! Captured request/response pairs and the recorders that receive them.
use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use http::HeaderMap;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::body::Body;
use crate::cookies::{extract_request_cookies, Cookie};
use crate::errors::{Error, Result};
use crate::{Request, Response};

/// Decoded `key=value` pairs, repeated keys kept in order.
pub type FormValues = BTreeMap<String, Vec<String>>;

/// The request half of a [`CapturedExchange`].
#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
  /// request method
  pub method: String,
  /// absolute URL of the forwarded request
  pub url: String,
  /// query string parameters
  pub query: FormValues,
  /// headers as forwarded
  #[serde(with = "http_serde::header_map")]
  pub headers: HeaderMap,
  /// cookies from the `Cookie` header
  pub cookies: Vec<Cookie<'static>>,
  /// request body
  pub body: Body,
  /// declared `Content-Length`
  pub content_length: Option<u64>,
  /// `application/x-www-form-urlencoded` body fields
  pub post_form: FormValues,
}

/// The response half of a [`CapturedExchange`].
#[derive(Debug, Clone, Serialize)]
pub struct CapturedResponse {
  /// numeric status
  pub status: u16,
  /// reason phrase
  pub reason: String,
  /// headers as relayed
  #[serde(with = "http_serde::header_map")]
  pub headers: HeaderMap,
  /// cookies from `Set-Cookie` headers
  pub cookies: Vec<Cookie<'static>>,
  /// response body
  pub body: Body,
  /// `Content-Length` of the relayed response
  pub content_length: Option<u64>,
}

/// A materialized request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedExchange {
  /// request
  pub request: CapturedRequest,
  /// response
  pub response: CapturedResponse,
  /// when the exchange completed
  #[serde(with = "time::serde::rfc3339")]
  pub created_at: OffsetDateTime,
}

impl CapturedExchange {
  /// Snapshot `request` and `response`; `url` is the absolute URL the request was sent to.
  pub fn new(url: String, request: &Request, response: &Response) -> Self {
    CapturedExchange {
      request: CapturedRequest::new(url, request),
      response: CapturedResponse::from(response),
      created_at: OffsetDateTime::now_utc(),
    }
  }
}

impl CapturedRequest {
  fn new(url: String, request: &Request) -> Self {
    let body = request.body().cloned().unwrap_or_default();
    let query = request.uri().query().map(parse_form).unwrap_or_default();
    let is_form = request
      .headers()
      .get(http::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.split(';').next())
      .is_some_and(|v| {
        v.trim()
          .eq_ignore_ascii_case("application/x-www-form-urlencoded")
      });
    let post_form = if is_form {
      parse_form(&String::from_utf8_lossy(&body))
    } else {
      FormValues::new()
    };
    CapturedRequest {
      method: request.method().to_string(),
      url,
      query,
      headers: request.headers().clone(),
      cookies: extract_request_cookies(request.headers()),
      content_length: request.content_length(),
      body,
      post_form,
    }
  }
}

impl From<&Response> for CapturedResponse {
  fn from(response: &Response) -> Self {
    CapturedResponse {
      status: response.status_code().as_u16(),
      reason: response.reason().to_string(),
      headers: response.headers().clone(),
      cookies: response.cookies().map(Cookie::into_owned).collect(),
      body: response.body().clone().unwrap_or_default(),
      content_length: response.content_length(),
    }
  }
}

/// Decode an `application/x-www-form-urlencoded` string.
pub fn parse_form(input: &str) -> FormValues {
  let mut values = FormValues::new();
  for pair in input.split('&').filter(|p| !p.is_empty()) {
    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
    values
      .entry(decode_component(key))
      .or_default()
      .push(decode_component(value));
  }
  values
}

fn decode_component(input: &str) -> String {
  let input = input.replace('+', " ");
  percent_decode_str(&input).decode_utf8_lossy().into_owned()
}

/// Receives every captured exchange.
///
/// Called once per exchange, after the origin response is read and before it
/// is written to the client. An error is logged by the caller and otherwise
/// ignored.
#[async_trait]
pub trait Recorder: Send + Sync + Debug {
  /// Record one exchange.
  async fn record(&self, exchange: CapturedExchange) -> Result<()>;
}

/// Logs a summary of each exchange, and its JSON form at `debug`.
#[derive(Debug, Default, Clone)]
pub struct LogRecorder;

#[async_trait]
impl Recorder for LogRecorder {
  async fn record(&self, exchange: CapturedExchange) -> Result<()> {
    tracing::info!(
      method = %exchange.request.method,
      url = %exchange.request.url,
      status = exchange.response.status,
      request_bytes = exchange.request.body.len(),
      response_bytes = exchange.response.body.len(),
      "captured"
    );
    if tracing::enabled!(tracing::Level::DEBUG) {
      let json = serde_json::to_string(&exchange).map_err(|e| Error::capture(e.to_string()))?;
      tracing::debug!(exchange = %json);
    }
    Ok(())
  }
}

/// Forwards exchanges to a consumer over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
  sender: mpsc::UnboundedSender<CapturedExchange>,
}

impl ChannelRecorder {
  /// A recorder and the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<CapturedExchange>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelRecorder { sender }, receiver)
  }
}

#[async_trait]
impl Recorder for ChannelRecorder {
  async fn record(&self, exchange: CapturedExchange) -> Result<()> {
    self
      .sender
      .send(exchange)
      .map_err(|_| Error::capture("capture receiver dropped"))
  }
}

/// Drops every exchange.
#[derive(Debug, Default, Clone)]
pub struct DiscardRecorder;

#[async_trait]
impl Recorder for DiscardRecorder {
  async fn record(&self, _exchange: CapturedExchange) -> Result<()> {
    Ok(())
  }
}
