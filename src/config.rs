//! Proxy configuration and command line mapping.

use crate::cache::CachePolicy;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Size limits applied while parsing HTTP messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpLimits {
  /// Maximum bytes for a request/status line plus headers.
  pub max_header_size: usize,
  /// Maximum bytes for one buffered body.
  pub max_body_size: usize,
}

impl Default for HttpLimits {
  fn default() -> Self {
    Self {
      max_header_size: 64 * 1024,
      max_body_size: 32 * 1024 * 1024,
    }
  }
}

/// Configuration for the intercepting proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address the listener binds to
  pub listen_addr: String,
  /// PKCS8 PEM private key of the root credential
  pub ca_key_path: PathBuf,
  /// PEM X.509 certificate of the root credential
  pub ca_cert_path: PathBuf,
  /// Leaf certificate cache policy
  pub cache: CachePolicy,
  /// Parser limits
  pub limits: HttpLimits,
  /// Upstream connect timeout
  pub connect_timeout: Option<Duration>,
  /// Upper bound for reading one whole upstream response
  pub read_timeout: Option<Duration>,
  /// Upstream write timeout
  pub write_timeout: Option<Duration>,
  /// Verify origin certificates
  pub upstream_verify: bool,
  /// Extra PEM bundle trusted for origin certificates
  pub upstream_ca_bundle: Option<PathBuf>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8080".to_string(),
      ca_key_path: PathBuf::from("certs/ca.key"),
      ca_cert_path: PathBuf::from("certs/ca.crt"),
      cache: CachePolicy::default(),
      limits: HttpLimits::default(),
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      upstream_verify: true,
      upstream_ca_bundle: None,
    }
  }
}

/// HTTP/HTTPS intercepting forward proxy.
///
/// Terminates client TLS with per-host certificates signed by a local root,
/// forwards each request to its origin and records the exchange.
#[derive(Parser, Debug)]
#[command(name = "mitm-proxy")]
#[command(version, about)]
pub struct Cli {
  /// Address to listen on.
  #[arg(short = 'l', long = "listen", env = "PROXY_ADDR", default_value = "127.0.0.1:8080")]
  pub listen: String,

  /// Root private key (PEM, PKCS8).
  #[arg(long = "ca-key", env = "PROXY_KEY_PATH", default_value = "certs/ca.key")]
  pub ca_key: PathBuf,

  /// Root certificate (PEM).
  #[arg(long = "ca-cert", env = "PROXY_CERT_PATH", default_value = "certs/ca.crt")]
  pub ca_cert: PathBuf,

  /// Write a new root key/certificate to --ca-key/--ca-cert and exit.
  #[arg(long)]
  pub generate_ca: bool,

  /// Drop cached leaf certificates after this many seconds (default: never).
  #[arg(long)]
  pub cache_ttl_secs: Option<u64>,

  /// Cap the number of cached leaf certificates (default: unbounded).
  #[arg(long)]
  pub cache_max_entries: Option<u64>,

  /// Upstream connect timeout in seconds, 0 disables it.
  #[arg(long, default_value_t = 10)]
  pub connect_timeout: u64,

  /// Upstream read/write timeout in seconds, 0 disables it.
  #[arg(long, default_value_t = 30)]
  pub io_timeout: u64,

  /// Largest request or response body buffered, in bytes.
  #[arg(long, default_value_t = 32 * 1024 * 1024)]
  pub max_body_size: usize,

  /// Skip verification of origin certificates.
  #[arg(long)]
  pub upstream_insecure: bool,

  /// Additional PEM bundle trusted for origin certificates.
  #[arg(long)]
  pub upstream_ca: Option<PathBuf>,

  /// Log level used when RUST_LOG is not set.
  #[arg(long, default_value = "info")]
  pub log_level: String,
}

fn seconds(value: u64) -> Option<Duration> {
  (value > 0).then(|| Duration::from_secs(value))
}

impl From<&Cli> for ProxyConfig {
  fn from(cli: &Cli) -> Self {
    let io_timeout = seconds(cli.io_timeout);
    ProxyConfig {
      listen_addr: cli.listen.clone(),
      ca_key_path: cli.ca_key.clone(),
      ca_cert_path: cli.ca_cert.clone(),
      cache: CachePolicy {
        max_entries: cli.cache_max_entries,
        time_to_live: cli.cache_ttl_secs.map(Duration::from_secs),
      },
      limits: HttpLimits {
        max_body_size: cli.max_body_size,
        ..HttpLimits::default()
      },
      connect_timeout: seconds(cli.connect_timeout),
      read_timeout: io_timeout,
      write_timeout: io_timeout,
      upstream_verify: !cli.upstream_insecure,
      upstream_ca_bundle: cli.upstream_ca.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cli_defaults_match_config_defaults() {
    let cli = Cli::try_parse_from(["mitm-proxy"]).unwrap();
    let config = ProxyConfig::from(&cli);
    let defaults = ProxyConfig::default();
    assert_eq!(config.connect_timeout, defaults.connect_timeout);
    assert_eq!(config.read_timeout, defaults.read_timeout);
    assert_eq!(config.limits, defaults.limits);
    assert_eq!(config.cache, CachePolicy::default());
    assert!(config.upstream_verify);
  }

  #[test]
  fn zero_timeouts_disable_deadlines() {
    let cli = Cli::try_parse_from([
      "mitm-proxy",
      "--listen",
      "0.0.0.0:3128",
      "--connect-timeout",
      "0",
      "--io-timeout",
      "0",
      "--cache-ttl-secs",
      "3600",
      "--upstream-insecure",
    ])
    .unwrap();
    let config = ProxyConfig::from(&cli);
    assert_eq!(config.listen_addr, "0.0.0.0:3128");
    assert_eq!(config.connect_timeout, None);
    assert_eq!(config.write_timeout, None);
    assert_eq!(config.cache.time_to_live, Some(Duration::from_secs(3600)));
    assert!(!config.upstream_verify);
  }
}
