//! Per-connection protocol logic
//!
//! A connection starts with one proxy request. `CONNECT` turns it into an
//! intercepted TLS tunnel carrying any number of sequential requests; any
//! other method is forwarded once in plain text and the connection is closed.
//!

use std::fmt;
use std::sync::Arc;

use http::header::HOST;
use http::{HeaderValue, Method, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::ca::CertificateAuthority;
use crate::config::HttpLimits;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::headers::strip_hop_by_hop;
use crate::record::{CapturedExchange, Recorder};
use crate::request::RequestParser;
use crate::response::{ResponseBuilder, ResponseConfig};
use crate::{Request, Response};

/// Literal reply to an accepted `CONNECT`.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// An origin endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  /// host name or IP literal, without IPv6 brackets
  pub host: String,
  /// TCP port
  pub port: u16,
  /// whether the origin is spoken to over TLS
  pub tls: bool,
}

impl Target {
  fn new(host: &str, port: Option<u16>, tls: bool) -> Result<Self> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(Error::protocol("request target without a host"));
    }
    Ok(Target {
      host: host.to_string(),
      port: port.unwrap_or(if tls { 443 } else { 80 }),
      tls,
    })
  }

  /// Target of a `CONNECT host[:port]` request; the port defaults to 443.
  pub fn from_connect(uri: &Uri) -> Result<Self> {
    let authority = uri
      .authority()
      .ok_or_else(|| Error::protocol(format!("CONNECT target {uri} is not host:port")))?;
    Target::new(authority.host(), authority.port_u16(), true)
  }

  /// Target of a plain proxy request: the absolute URI, else the `Host` header.
  pub fn from_request(request: &Request) -> Result<Self> {
    let uri = request.uri();
    let tls = uri.scheme() == Some(&http::uri::Scheme::HTTPS);
    if let Some(authority) = uri.authority() {
      return Target::new(authority.host(), authority.port_u16(), tls);
    }
    let host = request
      .headers()
      .get(HOST)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::protocol(format!("no host in request for {uri}")))?;
    let authority: http::uri::Authority = host
      .parse()
      .map_err(|_| Error::protocol(format!("invalid host header {host:?}")))?;
    Target::new(authority.host(), authority.port_u16(), tls)
  }

  fn scheme(&self) -> &'static str {
    if self.tls {
      "https"
    } else {
      "http"
    }
  }

  /// `host[:port]`, omitting the scheme's default port.
  pub fn authority(&self) -> String {
    let host = if self.host.contains(':') {
      format!("[{}]", self.host)
    } else {
      self.host.clone()
    };
    let default_port = if self.tls { 443 } else { 80 };
    if self.port == default_port {
      host
    } else {
      format!("{host}:{}", self.port)
    }
  }

  /// Absolute URL of `request` when sent to this target.
  pub fn url_for(&self, request: &Request) -> String {
    let uri = request.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
      return uri.to_string();
    }
    let path = uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .filter(|pq| pq.starts_with('/'))
      .unwrap_or("/");
    format!("{}://{}{}", self.scheme(), self.authority(), path)
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// One intercepted tunnel: the decrypted client stream and where it leads.
struct TunnelSession<S> {
  target: Target,
  stream: BufReader<TlsStream<BufReader<S>>>,
  exchanges: u64,
}

/// Serves one accepted client connection.
#[derive(Clone)]
pub struct ConnectionHandler {
  authority: Arc<CertificateAuthority>,
  connector: Connector,
  recorder: Arc<dyn Recorder>,
  limits: HttpLimits,
}

impl fmt::Debug for ConnectionHandler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionHandler")
      .field("connector", &self.connector)
      .field("recorder", &self.recorder)
      .field("limits", &self.limits)
      .finish_non_exhaustive()
  }
}

impl ConnectionHandler {
  /// Handler issuing leaves from `authority`, dialing with `connector` and
  /// recording into `recorder`.
  pub fn new(
    authority: Arc<CertificateAuthority>,
    connector: Connector,
    recorder: Arc<dyn Recorder>,
    limits: HttpLimits,
  ) -> Self {
    ConnectionHandler {
      authority,
      connector,
      recorder,
      limits,
    }
  }

  /// Drive `stream` to completion.
  ///
  /// Returns `Ok` when the client ends the connection cleanly. Errors concern
  /// this connection only.
  pub async fn handle<S>(&self, stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut reader = BufReader::new(stream);
    let Some(request) = RequestParser::new(&mut reader, self.limits).parse().await? else {
      tracing::debug!("client closed before sending a request");
      return Ok(());
    };
    if request.method() == Method::CONNECT {
      let session = self.establish(reader, &request).await?;
      self.run_tunnel(session).await
    } else {
      self.forward_plain(reader, request).await
    }
  }

  /// Acknowledge the CONNECT and terminate the client's TLS with a leaf for its host.
  async fn establish<S>(&self, mut reader: BufReader<S>, request: &Request) -> Result<TunnelSession<S>>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let target = Target::from_connect(request.uri())?;
    reader.write_all(CONNECT_ESTABLISHED).await?;
    reader.flush().await?;
    let config = self.authority.tls_config(&target.host).await?;
    let stream = TlsAcceptor::from(config)
      .accept(reader)
      .await
      .map_err(|e| Error::protocol(format!("client handshake for {}: {e}", target.host)))?;
    tracing::debug!(target = %target, "tunnel established");
    Ok(TunnelSession {
      target,
      stream: BufReader::new(stream),
      exchanges: 0,
    })
  }

  /// Serve sequential requests over an established tunnel until the client is done.
  async fn run_tunnel<S>(&self, mut session: TunnelSession<S>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    loop {
      let parsed = RequestParser::new(&mut session.stream, self.limits)
        .parse()
        .await?;
      let Some(request) = parsed else {
        break;
      };
      if request.method() == Method::CONNECT {
        return Err(Error::protocol("CONNECT inside an established tunnel"));
      }
      let close = request.wants_close();
      let url = session.target.url_for(&request);
      self
        .forward(&mut session.stream, &session.target, request, url)
        .await?;
      session.exchanges += 1;
      if close {
        break;
      }
    }
    if let Err(err) = session.stream.shutdown().await {
      tracing::debug!(error = %err, "tunnel close_notify failed");
    }
    tracing::debug!(
      target = %session.target,
      exchanges = session.exchanges,
      "tunnel closed"
    );
    Ok(())
  }

  async fn forward_plain<S>(&self, mut reader: BufReader<S>, request: Request) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let target = Target::from_request(&request)?;
    let url = target.url_for(&request);
    self.forward(&mut reader, &target, request, url).await?;
    if let Err(err) = reader.shutdown().await {
      tracing::debug!(error = %err, "client shutdown failed");
    }
    Ok(())
  }

  /// Relay one request to `target`, record the exchange and answer the client.
  async fn forward<W>(
    &self,
    client: &mut W,
    target: &Target,
    mut request: Request,
    url: String,
  ) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    strip_hop_by_hop(request.headers_mut());
    set_host(&mut request, target)?;
    let mut response = match self.round_trip(target, &request).await {
      Ok(response) => response,
      Err(err) => {
        let bad_gateway = Response::bad_gateway().to_raw();
        if let Err(write_err) = client.write_all(&bad_gateway).await {
          tracing::debug!(error = %write_err, "could not send 502 to client");
        } else if let Err(flush_err) = client.flush().await {
          tracing::debug!(error = %flush_err, "could not send 502 to client");
        }
        return Err(err);
      }
    };
    response.prepare_for_relay();
    tracing::info!(
      method = %request.method(),
      url = %url,
      status = response.status_code().as_u16(),
      "forwarded"
    );
    let exchange = CapturedExchange::new(url, &request, &response);
    if let Err(err) = self.recorder.record(exchange).await {
      tracing::warn!(error = %err, "capture failed");
    }
    client.write_all(&response.to_raw()).await?;
    client.flush().await?;
    Ok(())
  }

  /// Dial a fresh upstream connection, send `request` and read the final response.
  async fn round_trip(&self, target: &Target, request: &Request) -> Result<Response> {
    let mut socket = self.connector.connect(&target.host, target.port).await?;
    if target.tls {
      socket = self.connector.upgrade_to_tls(socket, &target.host).await?;
    }
    socket
      .write_all(&request.to_raw())
      .await
      .map_err(|e| Error::upstream(target, e))?;
    socket.flush().await.map_err(|e| Error::upstream(target, e))?;
    let config = ResponseConfig::new(request, socket.read_timeout(), self.limits);
    let mut reader = BufReader::new(socket);
    ResponseBuilder::new(&mut reader, config)
      .build()
      .await
      .map_err(|e| e.on_upstream(target))
  }
}

/// Point `Host` at `target`. An absolute-form request target replaces
/// whatever `Host` the client sent.
fn set_host(request: &mut Request, target: &Target) -> Result<()> {
  if request.uri().authority().is_none() && request.headers().contains_key(HOST) {
    return Ok(());
  }
  let host = HeaderValue::from_str(&target.authority())?;
  request.headers_mut().insert(HOST, host);
  Ok(())
}
