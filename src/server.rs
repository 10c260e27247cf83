//! MITM proxy server: listener, accept loop and graceful shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::ca::{CertificateAuthority, RootCredential};
use crate::cache::HostCertCache;
use crate::config::{HttpLimits, ProxyConfig};
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::handler::ConnectionHandler;
use crate::record::{LogRecorder, Recorder};

/// Proxy server implementation
#[derive(Debug, Clone)]
pub struct ProxyServer {
  authority: Arc<CertificateAuthority>,
  handler: ConnectionHandler,
}

/// Builder for `ProxyServer`.
///
/// Only the certificate authority is mandatory. The connector defaults to
/// [`Connector::builder`] and captured exchanges go to a [`LogRecorder`].
#[derive(Default)]
pub struct ProxyServerBuilder {
  authority: Option<Arc<CertificateAuthority>>,
  connector: Option<Connector>,
  recorder: Option<Arc<dyn Recorder>>,
  limits: HttpLimits,
}

impl ProxyServerBuilder {
  /// Set the `CertificateAuthority` leaves are issued from.
  pub fn authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
    self.authority = Some(authority);
    self
  }

  /// Set the `Connector` used to reach origins.
  pub fn connector(mut self, connector: Connector) -> Self {
    self.connector = Some(connector);
    self
  }

  /// Set the sink for captured exchanges.
  pub fn recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
    self.recorder = Some(recorder);
    self
  }

  /// Set header and body size limits.
  pub fn limits(mut self, limits: HttpLimits) -> Self {
    self.limits = limits;
    self
  }

  /// Build the `ProxyServer`.
  pub fn build(self) -> Result<ProxyServer> {
    let authority = self
      .authority
      .ok_or_else(|| Error::config("a certificate authority is required"))?;
    let connector = match self.connector {
      Some(connector) => connector,
      None => Connector::builder().build()?,
    };
    let recorder = self.recorder.unwrap_or_else(|| Arc::new(LogRecorder));
    let handler = ConnectionHandler::new(authority.clone(), connector, recorder, self.limits);
    Ok(ProxyServer { authority, handler })
  }
}

impl ProxyServer {
  /// Default builder.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// Load the root credential named by `config` and assemble a server around it.
  pub async fn new(config: &ProxyConfig, recorder: Arc<dyn Recorder>) -> Result<Self> {
    let root = RootCredential::load(&config.ca_key_path, &config.ca_cert_path).await?;
    let authority = CertificateAuthority::new(root, HostCertCache::new(config.cache));
    let mut connector = Connector::builder()
      .certs_verification(config.upstream_verify)
      .connect_timeout(config.connect_timeout)
      .read_timeout(config.read_timeout)
      .write_timeout(config.write_timeout);
    if let Some(path) = &config.upstream_ca_bundle {
      let pem = tokio::fs::read(path)
        .await
        .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
      connector = connector.root_certificates(pem);
    }
    ProxyServer::builder()
      .authority(Arc::new(authority))
      .connector(connector.build()?)
      .recorder(recorder)
      .limits(config.limits)
      .build()
  }

  /// The certificate authority in use.
  pub fn authority(&self) -> &Arc<CertificateAuthority> {
    &self.authority
  }

  /// The per-connection handler.
  pub fn handler(&self) -> &ConnectionHandler {
    &self.handler
  }

  /// Bind the listening socket.
  pub async fn bind(self, addr: &str) -> Result<ProxyListener> {
    let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
      addr: addr.to_string(),
      source,
    })?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "proxy listening");
    Ok(ProxyListener {
      listener,
      handler: self.handler,
    })
  }

  /// Bind `addr` and serve until `shutdown` resolves.
  pub async fn start<F>(self, addr: &str, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    self.bind(addr).await?.serve(shutdown).await
  }
}

/// A bound proxy ready to accept clients.
#[derive(Debug)]
pub struct ProxyListener {
  listener: TcpListener,
  handler: ConnectionHandler,
}

impl ProxyListener {
  /// Address actually bound, useful after binding port 0.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept connections until `shutdown` resolves, then wait for in-flight
  /// connections to finish.
  ///
  /// Accept failures and per-connection errors are logged and never stop the loop.
  pub async fn serve<F>(self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    let mut tasks = JoinSet::new();
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          tracing::info!("shutdown requested, no longer accepting");
          break;
        }
        accepted = self.listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let handler = self.handler.clone();
            let span = tracing::info_span!("conn", %peer);
            tasks.spawn(handle_connection(handler, stream).instrument(span));
          }
          Err(err) => tracing::error!(error = %err, "failed to accept connection"),
        },
        Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(joined),
      }
    }
    drop(self.listener);
    if !tasks.is_empty() {
      tracing::info!(active = tasks.len(), "draining connections");
    }
    while let Some(joined) = tasks.join_next().await {
      reap(joined);
    }
    tracing::info!("proxy stopped");
    Ok(())
  }
}

async fn handle_connection(handler: ConnectionHandler, stream: TcpStream) {
  tracing::trace!("accepted");
  if let Err(err) = handler.handle(stream).await {
    tracing::warn!(kind = ?err.kind(), error = %err, "connection ended with error");
  }
}

fn reap(joined: std::result::Result<(), tokio::task::JoinError>) {
  if let Err(err) = joined {
    if err.is_panic() {
      tracing::error!(error = %err, "connection task panicked");
    }
  }
}
