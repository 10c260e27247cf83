//! TLS configuration for both legs of an intercepted connection
//!
use std::io::Cursor;
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};

use crate::errors::{Error, Result};

/// ALPN protocols offered on both legs; HTTP/2 is never negotiated.
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";

/// The `ring` crypto provider used by every config built here.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Every certificate in a PEM buffer; an empty or garbled buffer is an error.
pub(crate) fn read_pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
  let certs = rustls_pemfile::certs(&mut Cursor::new(pem))
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::config(format!("invalid certificate PEM: {e}")))?;
  if certs.is_empty() {
    return Err(Error::config("no certificate found in PEM"));
  }
  Ok(certs)
}

/// The first private key in a PEM buffer.
pub(crate) fn read_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
  rustls_pemfile::private_key(&mut Cursor::new(pem))
    .map_err(|e| Error::config(format!("invalid private key PEM: {e}")))?
    .ok_or_else(|| Error::config("no private key found in PEM"))
}

/// Server config presenting `chain` to intercepted clients.
pub(crate) fn server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
  let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::cert_gen(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| Error::cert_gen(format!("unusable leaf credential: {e}")))?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

/// Trust store for origin certificates, seeded with the bundled web roots.
pub(crate) fn root_store() -> RootCertStore {
  let mut roots = RootCertStore::empty();
  roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
  roots
}

/// Client config for the upstream leg.
///
/// With `verify` unset the origin chain is accepted as is, handshake
/// signatures are still checked.
pub(crate) fn client_config(roots: RootCertStore, verify: bool) -> Result<rustls::ClientConfig> {
  let provider = crypto_provider();
  let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::config(e.to_string()))?;
  let mut config = if verify {
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

/// Server name for SNI, accepting bracketed IPv6 literals.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  ServerName::try_from(host.to_string())
    .map_err(|e| Error::protocol(format!("invalid server name {host:?}: {e}")))
}

#[derive(Debug)]
pub(crate) struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls12_signature(
      message,
      cert,
      dss,
      &self.0.signature_verification_algorithms,
    )
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls13_signature(
      message,
      cert,
      dss,
      &self.0.signature_verification_algorithms,
    )
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self
      .0
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pem_helpers_reject_garbage() {
    assert!(read_pem_certs(b"").is_err());
    assert!(read_pem_certs(b"not a pem").is_err());
    assert!(read_private_key(b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n").is_err());
  }

  #[test]
  fn server_names_accept_hosts_and_ips() {
    assert!(matches!(server_name("example.com").unwrap(), ServerName::DnsName(_)));
    assert!(matches!(server_name("127.0.0.1").unwrap(), ServerName::IpAddress(_)));
    assert!(matches!(server_name("[::1]").unwrap(), ServerName::IpAddress(_)));
    assert!(server_name("bad host").is_err());
  }

  #[test]
  fn root_store_has_web_roots() {
    let roots = root_store();
    assert!(!roots.is_empty());
    assert!(client_config(roots, false).is_ok());
  }
}
