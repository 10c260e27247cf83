//! proxy error
use std::fmt::Display;
use std::io::ErrorKind as IoErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `mitm_proxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while running the proxy.
///
/// `Config` and `Bind` only happen at startup and stop the process. Every other
/// variant is scoped to a single connection (or a single forwarded request) and
/// is logged at the connection boundary.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Root credential files missing or unparsable, or an invalid setting.
  #[error("config error: {0}")]
  Config(String),
  /// The listening address could not be bound.
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// requested address
    addr: String,
    /// underlying socket error
    #[source]
    source: std::io::Error,
  },
  /// Leaf key generation, signing or encoding failed.
  #[error("certificate generation failed: {0}")]
  CertGen(String),
  /// Malformed request/response, failed handshake or truncated stream.
  #[error("protocol error: {0}")]
  Protocol(String),
  /// Dial, write or read failure towards the origin.
  #[error("upstream error: {0}")]
  Upstream(String),
  /// The capture collaborator rejected an exchange.
  #[error("capture failed: {0}")]
  Capture(String),
  /// Client-side transport error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// see [`Error::Config`]
  Config,
  /// see [`Error::Bind`]
  Bind,
  /// see [`Error::CertGen`]
  CertGen,
  /// see [`Error::Protocol`] and [`Error::Http`]
  Protocol,
  /// see [`Error::Upstream`]
  Upstream,
  /// see [`Error::Capture`]
  Capture,
  /// see [`Error::IO`]
  Io,
}

impl Error {
  /// Build a config error.
  pub fn config(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }
  /// Build a certificate generation error.
  pub fn cert_gen(msg: impl Into<String>) -> Self {
    Error::CertGen(msg.into())
  }
  /// Build a protocol error.
  pub fn protocol(msg: impl Into<String>) -> Self {
    Error::Protocol(msg.into())
  }
  /// Build an upstream error naming the origin it concerns.
  pub fn upstream(target: impl Display, cause: impl Display) -> Self {
    Error::Upstream(format!("{target}: {cause}"))
  }
  /// Build a capture error.
  pub fn capture(msg: impl Into<String>) -> Self {
    Error::Capture(msg.into())
  }
  /// Returns the taxonomy bucket of this error.
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Config(_) => ErrorKind::Config,
      Error::Bind { .. } => ErrorKind::Bind,
      Error::CertGen(_) => ErrorKind::CertGen,
      Error::Protocol(_) | Error::Http(_) => ErrorKind::Protocol,
      Error::Upstream(_) => ErrorKind::Upstream,
      Error::Capture(_) => ErrorKind::Capture,
      Error::IO(_) => ErrorKind::Io,
    }
  }
  /// Startup-only errors that should terminate the process.
  pub fn is_fatal(&self) -> bool {
    matches!(self.kind(), ErrorKind::Config | ErrorKind::Bind)
  }
  /// Re-tag transport errors raised while talking to the origin.
  ///
  /// Parse failures stay protocol errors; raw I/O failures become upstream errors.
  pub(crate) fn on_upstream(self, target: impl Display) -> Self {
    match self {
      Error::IO(e) => Error::upstream(target, e),
      other => other,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: IoErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
