use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mitm_proxy::{Cli, LogRecorder, ProxyConfig, ProxyServer, RootCredential};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&cli.log_level))
    .context("invalid log filter")?;
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let config = ProxyConfig::from(&cli);
  if cli.generate_ca {
    let root = RootCredential::generate("mitm-proxy root CA")?;
    root
      .write_pem(&config.ca_key_path, &config.ca_cert_path)
      .await?;
    tracing::info!(
      key = %config.ca_key_path.display(),
      cert = %config.ca_cert_path.display(),
      "wrote new root credential; install the certificate in your client trust store"
    );
    return Ok(());
  }

  let server = ProxyServer::new(&config, Arc::new(LogRecorder))
    .await
    .context("failed to start proxy")?;
  server
    .start(&config.listen_addr, async {
      if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for ctrl-c, shutting down");
      }
    })
    .await?;
  Ok(())
}
