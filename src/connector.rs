use crate::errors::{new_io_error, Error, Result};
use crate::socket::Socket;
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::TlsConnector;

/// Builds the [`Connector`] used to reach origin servers.
#[derive(Clone)]
pub struct ConnectorBuilder {
  certs_verification: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  root_certificates: Vec<Vec<u8>>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      certs_verification: true,
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      root_certificates: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `true`.
  ///
  /// # Warning
  ///
  /// With validation off, *any* certificate presented by an origin is
  /// accepted, including expired and self-signed ones.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Set that all sockets have `TCP_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Trust the certificates of a PEM bundle in addition to the web roots.
  pub fn root_certificates(mut self, pem: impl Into<Vec<u8>>) -> ConnectorBuilder {
    self.root_certificates.push(pem.into());
    self
  }
  /// Bound on reading one whole response.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout, applied to each write.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase, per resolved address.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
}

impl ConnectorBuilder {
  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let mut root_cert_store = tls::root_store();
    for pem in &self.root_certificates {
      for cert in tls::read_pem_certs(pem)? {
        root_cert_store
          .add(cert)
          .map_err(|e| Error::config(format!("unusable trust anchor: {e}")))?;
      }
    }
    let config = tls::client_config(root_cert_store, self.certs_verification)?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      tls: TlsConnector::from(Arc::new(config)),
    })
  }
}

/// Opens upstream connections: DNS, TCP and optional TLS.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl fmt::Debug for Connector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish_non_exhaustive()
  }
}

impl Connector {
  /// Default builder.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(s, self.read_timeout, self.write_timeout))
  }
  /// Resolve `host` and connect to the first address that accepts.
  ///
  /// Failures are reported as [`Error::Upstream`] naming `host:port`.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let target = format!("{host}:{port}");
    let addrs = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| Error::upstream(&target, format!("resolve: {e}")))?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::trace!(%target, %addr, "connected upstream");
          return Ok(socket);
        }
        Err(err) => {
          tracing::debug!(%target, %addr, error = %err, "upstream address failed");
          last_error = Some(err);
        }
      }
    }
    Err(match last_error {
      Some(err) => Error::upstream(&target, err),
      None => Error::upstream(&target, "no addresses resolved"),
    })
  }
  /// Run a TLS client handshake over `stream`, sending `domain` as SNI.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let server_name = tls::server_name(domain)?;
    let this = self.tls.clone();
    let tls = stream
      .tls(move |t| async move { this.connect(server_name, t).await })
      .await
      .map_err(|e| Error::upstream(domain, format!("tls handshake: {e}")))?;
    Ok(tls)
  }
}
