#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # mitm-proxy
//!
//! An HTTP/HTTPS forward proxy that intercepts TLS. Clients that trust the
//! proxy's root certificate see a certificate minted for whatever host they
//! `CONNECT` to; every decrypted request is forwarded to the real origin over
//! a fresh connection and the request/response pair is handed to a
//! [`Recorder`].
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mitm_proxy::{LogRecorder, ProxyConfig, ProxyServer};
//!
//! # async fn run() -> mitm_proxy::Result<()> {
//! let config = ProxyConfig::default();
//! let server = ProxyServer::new(&config, Arc::new(LogRecorder)).await?;
//! server
//!   .start(&config.listen_addr, async {
//!     let _ = tokio::signal::ctrl_c().await;
//!   })
//!   .await
//! # }
//! ```
//!
//! ## Root credential
//!
//! The root key and certificate are read once at startup from PEM files. A
//! fresh pair can be produced with [`RootCredential::generate`] and
//! [`RootCredential::write_pem`]; the binary exposes this as `--generate-ca`.
//!
//! ## Capturing traffic
//!
//! Implement [`Recorder`] to receive a [`CapturedExchange`] per forwarded
//! request. [`LogRecorder`] writes them to the log, [`ChannelRecorder`]
//! sends them over a channel.
//!
mod body;
mod ca;
mod cache;
mod config;
mod connector;
mod cookies;
mod errors;
mod handler;
mod headers;
/// capture of forwarded exchanges
pub mod record;
mod request;
mod response;
mod server;
mod socket;
mod tls;

pub use body::{Body, Framing};
pub use ca::{
  issue_leaf, CertificateAuthority, LeafCredential, RootCredential, LEAF_VALIDITY_DAYS, MAX_SERIAL,
};
pub use cache::{CachePolicy, HostCertCache};
pub use config::{Cli, HttpLimits, ProxyConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use cookies::Cookie;
pub use errors::{Error, ErrorKind, Result};
pub use handler::{ConnectionHandler, Target, CONNECT_ESTABLISHED};
pub use headers::{strip_hop_by_hop, HOP_BY_HOP};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use record::{
  parse_form, CapturedExchange, CapturedRequest, CapturedResponse, ChannelRecorder,
  DiscardRecorder, LogRecorder, Recorder,
};
pub use request::{Request, RequestParser};
pub use response::{Response, ResponseBuilder, ResponseConfig};
pub use server::{ProxyListener, ProxyServer, ProxyServerBuilder};
pub use socket::Socket;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
