//! Root credential handling and per-host leaf issuance
//!
//! Intercepted clients are shown a leaf certificate for the host they asked
//! for, signed by a locally trusted root. Leaves are issued on first use and
//! cached per host.
//!

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

use crate::cache::HostCertCache;
use crate::errors::{Error, Result};
use crate::tls;

/// Serials are drawn uniformly from `[0, MAX_SERIAL)`.
pub const MAX_SERIAL: u64 = 1_000_000_000;
/// Leaf validity in days
pub const LEAF_VALIDITY_DAYS: i64 = 365;
/// Root validity in days, for generated roots
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Organization written into every issued subject
const ORGANIZATION: &str = "mitm-proxy";

/// The signing root: private key plus its self-signed certificate.
pub struct RootCredential {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
}

impl fmt::Debug for RootCredential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RootCredential")
      .field("cert_der_len", &self.cert_der.len())
      .finish_non_exhaustive()
  }
}

impl RootCredential {
  /// Load the root from a PKCS8 key file and an X.509 certificate file.
  ///
  /// Any read or parse failure is a [`Error::Config`].
  pub async fn load(key_path: impl AsRef<Path>, cert_path: impl AsRef<Path>) -> Result<Self> {
    let (key_path, cert_path) = (key_path.as_ref(), cert_path.as_ref());
    let key_pem = fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::config(format!("cannot read root key {}: {e}", key_path.display())))?;
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::config(format!(
        "cannot read root certificate {}: {e}",
        cert_path.display()
      ))
    })?;
    let root = Self::from_pem(&key_pem, &cert_pem)?;
    tracing::info!(cert = %cert_path.display(), "loaded root credential");
    Ok(root)
  }

  /// Parse a root from PEM text.
  pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::config(format!("invalid root private key: {e}")))?;
    let cert_der = tls::read_pem_certs(cert_pem.as_bytes())?
      .into_iter()
      .next()
      .ok_or_else(|| Error::config("no root certificate found"))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::config(format!("invalid root certificate: {e}")))?;
    Ok(RootCredential {
      issuer,
      cert_der,
      cert_pem: cert_pem.to_string(),
    })
  }

  /// Create a fresh self-signed root named `common_name`.
  pub fn generate(common_name: &str) -> Result<Self> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::cert_gen(format!("root key generation: {e}")))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::cert_gen(format!("root self-signing: {e}")))?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::cert_gen(format!("root issuer: {e}")))?;
    Ok(RootCredential {
      issuer,
      cert_der,
      cert_pem,
    })
  }

  /// Persist key and certificate as PEM. Existing files are never overwritten.
  pub async fn write_pem(&self, key_path: impl AsRef<Path>, cert_path: impl AsRef<Path>) -> Result<()> {
    let key_pem = self.issuer.key().serialize_pem();
    write_new(key_path.as_ref(), key_pem.as_bytes()).await?;
    write_new(cert_path.as_ref(), self.cert_pem.as_bytes()).await
  }

  /// Root certificate as PEM, for installing into client trust stores.
  pub fn root_cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Root certificate as DER.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }
}

async fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    fs::create_dir_all(parent).await?;
  }
  let mut file = fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .open(path)
    .await
    .map_err(|e| Error::config(format!("cannot create {}: {e}", path.display())))?;
  file.write_all(contents).await?;
  file.flush().await?;
  Ok(())
}

/// A per-host certificate and key, PEM encoded, signed by the root.
#[derive(Clone)]
pub struct LeafCredential {
  host: String,
  serial: u64,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  cert_pem: String,
  key_pem: String,
  root_der: CertificateDer<'static>,
}

impl fmt::Debug for LeafCredential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafCredential")
      .field("host", &self.host)
      .field("serial", &self.serial)
      .field("not_after", &self.not_after)
      .finish_non_exhaustive()
  }
}

impl LeafCredential {
  /// Host the leaf was issued for, as written into CN and SAN.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Certificate serial number.
  pub fn serial(&self) -> u64 {
    self.serial
  }
  /// Start of validity.
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }
  /// End of validity.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
  /// Leaf certificate PEM.
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }
  /// Leaf private key PEM (PKCS8).
  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }
  /// Rebuild the served chain `[leaf, root]` and the leaf key from the PEM bytes.
  pub fn certified_chain(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut chain = tls::read_pem_certs(self.cert_pem.as_bytes())
      .map_err(|e| Error::cert_gen(e.to_string()))?;
    chain.push(self.root_der.clone());
    let key =
      tls::read_private_key(self.key_pem.as_bytes()).map_err(|e| Error::cert_gen(e.to_string()))?;
    Ok((chain, key))
  }
}

/// Hosts arrive as URI hosts; IPv6 literals are bracketed there.
pub(crate) fn normalize_host(host: &str) -> String {
  host
    .trim_start_matches('[')
    .trim_end_matches(']')
    .to_ascii_lowercase()
}

/// Generate a fresh P-256 key and a leaf certificate for `host` signed by `root`.
pub fn issue_leaf(host: &str, root: &RootCredential) -> Result<LeafCredential> {
  let host = normalize_host(host);
  let mut params = CertificateParams::default();

  let serial = rand::thread_rng().gen_range(0..MAX_SERIAL);
  params.serial_number = Some(SerialNumber::from(serial));

  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, host.as_str());
  dn.push(DnType::OrganizationName, ORGANIZATION);
  params.distinguished_name = dn;

  params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
    vec![SanType::IpAddress(ip)]
  } else {
    vec![SanType::DnsName(host.as_str().try_into().map_err(|_| {
      Error::cert_gen(format!("invalid host name {host:?}"))
    })?)]
  };
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyEncipherment,
  ];
  params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
  params.is_ca = IsCa::ExplicitNoCa;

  let now = OffsetDateTime::now_utc();
  params.not_before = now;
  params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

  let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
    .map_err(|e| Error::cert_gen(format!("key generation for {host}: {e}")))?;
  let cert = params
    .signed_by(&key_pair, &root.issuer)
    .map_err(|e| Error::cert_gen(format!("signing leaf for {host}: {e}")))?;

  Ok(LeafCredential {
    serial,
    not_before: params.not_before,
    not_after: params.not_after,
    cert_pem: cert.pem(),
    key_pem: key_pair.serialize_pem(),
    root_der: root.cert_der.clone(),
    host,
  })
}

/// Issues leaves from one root and caches them per host.
#[derive(Debug)]
pub struct CertificateAuthority {
  root: RootCredential,
  cache: HostCertCache,
}

impl CertificateAuthority {
  /// Authority signing with `root`, caching into `cache`.
  pub fn new(root: RootCredential, cache: HostCertCache) -> Self {
    CertificateAuthority { root, cache }
  }

  /// The signing root.
  pub fn root(&self) -> &RootCredential {
    &self.root
  }

  /// The leaf cache.
  pub fn cache(&self) -> &HostCertCache {
    &self.cache
  }

  /// Cached leaf for `host`, issuing and storing one on a miss.
  pub async fn leaf_for(&self, host: &str) -> Result<Arc<LeafCredential>> {
    let host = normalize_host(host);
    if let Some(leaf) = self.cache.get(&host).await {
      tracing::trace!(%host, serial = leaf.serial(), "leaf cache hit");
      return Ok(leaf);
    }
    let leaf = Arc::new(issue_leaf(&host, &self.root)?);
    tracing::debug!(%host, serial = leaf.serial(), "issued leaf certificate");
    self.cache.store(&host, leaf.clone()).await;
    Ok(leaf)
  }

  /// TLS server configuration presenting the leaf for `host`.
  pub async fn tls_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    let leaf = self.leaf_for(host).await?;
    let (chain, key) = leaf.certified_chain()?;
    Ok(Arc::new(tls::server_config(chain, key)?))
  }
}
