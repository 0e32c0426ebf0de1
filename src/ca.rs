//! Certificate authority and per-host certificate cache.
//!
//! The proxy impersonates intercepted hosts with leaf certificates signed by
//! a local root. The root key/certificate pair is loaded from the storage
//! directory when present, otherwise generated and persisted there; clients
//! install the root certificate to trust the interception.

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// A leaf certificate minted for one intercepted hostname.
///
/// Immutable once created; owned by the [`HostCertificateCache`] and shared
/// by every connection that intercepts the same host.
pub struct HostCertificate {
  /// the hostname the certificate was issued for
  hostname: String,
  /// certificate chain: [leaf, root]
  chain: Vec<CertificateDer<'static>>,
  /// leaf private key
  key: PrivateKeyDer<'static>,
  /// when the certificate was issued
  created_at: SystemTime,
}

impl HostCertificate {
  /// The hostname this certificate was issued for.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// The certificate chain, leaf first, root last.
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// When the certificate was issued.
  pub fn created_at(&self) -> SystemTime {
    self.created_at
  }

  /// Build a rustls server configuration presenting this certificate,
  /// used to terminate the client's TLS session during interception.
  pub fn server_config(&self) -> Result<ServerConfig> {
    ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(self.chain.clone(), self.key.clone_key())
      .map_err(|e| Error::certificate_issuance(format!("failed to build TLS config: {}", e)))
  }
}

/// Certificate authority for minting per-host leaf certificates.
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Key pair reused for every leaf certificate. Key generation dominates
  /// issuance cost, so only the certificate varies per host.
  leaf_key: KeyPair,
  /// Storage path for certificates
  storage_path: PathBuf,
  /// Number of leaf certificates issued so far
  issued: AtomicU64,
}

impl CertificateAuthority {
  /// Create a new certificate authority.
  ///
  /// If a root CA already exists at the storage path, it will be loaded.
  /// Otherwise, a new one will be generated and persisted. A failure here
  /// is fatal to proxy startup: interception is impossible without a root.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();

    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let ca_cert_path = storage_path.join("ca_cert.pem");
    let ca_key_path = storage_path.join("ca_key.pem");

    let (issuer, ca_cert_der) = if ca_cert_path.exists() && ca_key_path.exists() {
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      Self::generate_ca(&ca_cert_path, &ca_key_path).await?
    };

    let leaf_key = KeyPair::generate()
      .map_err(|e| Error::certificate_issuance(format!("failed to generate leaf key pair: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      leaf_key,
      storage_path,
      issued: AtomicU64::new(0),
    })
  }

  /// Load existing root certificate and key.
  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_issuance(format!("failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_issuance(format!("failed to create issuer from CA cert: {}", e))
    })?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_issuance("no certificate found in PEM"))?
      .map_err(|e| Error::certificate_issuance(format!("failed to parse PEM: {}", e)))?;

    Ok((issuer, cert_der))
  }

  /// Generate a new root certificate and key and persist them as PEM.
  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Periscope Proxy CA");
    dn.push(DnType::OrganizationName, "Periscope");
    dn.push(DnType::LocalityName, "Internet");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    // 10 year root validity
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_issuance(format!("failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_issuance(format!("failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;

    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_issuance(format!("failed to create issuer: {}", e)))?;

    Ok((issuer, cert_der))
  }

  /// Issue a leaf certificate for the given hostname, signed by the root.
  ///
  /// The hostname becomes the subject common name and a DNS (or IP) subject
  /// alternative name. Fails on a malformed hostname or a signing failure.
  pub fn issue(&self, hostname: &str) -> Result<HostCertificate> {
    if hostname.is_empty() || hostname.chars().any(|c| c.is_whitespace()) {
      return Err(Error::certificate_issuance(format!(
        "malformed hostname: {:?}",
        hostname
      )));
    }
    let mut params = CertificateParams::default();

    // random serial so every issued certificate is unique
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // If the hostname parses as an IP literal, include both an IP SAN and a
    // DNS SAN. Some clients strictly check iPAddress in SAN for IP targets
    // while others may check dNSName.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_issuance(format!("invalid hostname: {}", hostname))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let cert = params
      .signed_by(&self.leaf_key, &self.issuer)
      .map_err(|e| Error::certificate_issuance(format!("failed to sign leaf cert: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(self.leaf_key.serialize_der())
      .map_err(|_| Error::certificate_issuance("failed to serialize leaf key"))?;

    self.issued.fetch_add(1, Ordering::SeqCst);
    Ok(HostCertificate {
      hostname: hostname.to_string(),
      chain: vec![cert_der, self.ca_cert_der.clone()],
      key: key_der,
      created_at: SystemTime::now(),
    })
  }

  /// Number of leaf certificates issued by this authority so far.
  pub fn issued_count(&self) -> u64 {
    self.issued.load(Ordering::SeqCst)
  }

  /// Get the root certificate in PEM format for client installation.
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path())
      .map_err(|e| Error::certificate_issuance(format!("failed to read CA cert: {}", e)))
  }

  /// Get the root certificate path.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join("ca_cert.pem")
  }
}

/// Memoizes one issued certificate per destination host.
///
/// Concurrent first requests for the same hostname result in exactly one
/// issuance and all callers receive the same certificate; requests for
/// different hostnames never block on each other. Entries live for the
/// process lifetime — growth is bounded in practice by the number of
/// distinct hosts visited.
pub struct HostCertificateCache {
  ca: Arc<CertificateAuthority>,
  cache: Cache<String, Arc<HostCertificate>>,
}

impl HostCertificateCache {
  /// Create a cache over the given authority.
  pub fn new(ca: Arc<CertificateAuthority>) -> Self {
    Self {
      ca,
      cache: Cache::builder().build(),
    }
  }

  /// Get the certificate for a hostname, issuing it on first use.
  ///
  /// Issuance happens at most once per hostname; a failed issuance is not
  /// cached, so a later request may retry.
  pub async fn get_or_create(&self, hostname: &str) -> Result<Arc<HostCertificate>> {
    let ca = self.ca.clone();
    let key = hostname.to_string();
    let host = key.clone();
    self
      .cache
      .try_get_with(key, async move { ca.issue(&host).map(Arc::new) })
      .await
      .map_err(|e: Arc<Error>| Error::CertificateIssuance(e.to_string()))
  }

  /// The authority backing this cache.
  pub fn authority(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn temp_ca(tag: &str) -> (PathBuf, Arc<CertificateAuthority>) {
    let dir = std::env::temp_dir().join(format!("periscope-test-ca-{tag}"));
    if dir.exists() {
      std::fs::remove_dir_all(&dir).ok();
    }
    let ca = CertificateAuthority::new(&dir).await.unwrap();
    (dir, Arc::new(ca))
  }

  #[tokio::test]
  async fn test_ca_generation_and_pem_export() {
    let (dir, ca) = temp_ca("generate").await;
    let pem = ca.ca_cert_pem().unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
    assert!(pem.contains("END CERTIFICATE"));
    assert!(ca.ca_cert_path().exists());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_ca_reloads_persisted_root() {
    let (dir, ca) = temp_ca("reload").await;
    let first_pem = ca.ca_cert_pem().unwrap();
    drop(ca);
    let reloaded = CertificateAuthority::new(&dir).await.unwrap();
    assert_eq!(first_pem, reloaded.ca_cert_pem().unwrap());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_issue_chain_and_tls_config() {
    let (dir, ca) = temp_ca("issue").await;
    let cert = ca.issue("example.com").unwrap();
    assert_eq!(cert.hostname(), "example.com");
    assert_eq!(cert.chain().len(), 2, "expected [leaf, root] chain");
    assert!(cert.server_config().is_ok());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_issue_for_ip_literal() {
    let (dir, ca) = temp_ca("ip").await;
    let cert = ca.issue("127.0.0.1").unwrap();
    assert!(cert.server_config().is_ok());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_issue_rejects_malformed_hostname() {
    let (dir, ca) = temp_ca("malformed").await;
    assert!(ca.issue("").is_err());
    assert!(ca.issue("not a hostname").is_err());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_cache_issues_exactly_once_under_concurrency() {
    let (dir, ca) = temp_ca("concurrent").await;
    let cache = Arc::new(HostCertificateCache::new(ca.clone()));
    let tasks: Vec<_> = (0..16)
      .map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_or_create("example.com").await.unwrap() })
      })
      .collect();
    let certs = futures::future::join_all(tasks).await;
    assert_eq!(ca.issued_count(), 1, "expected a single issuance");
    let first = certs[0].as_ref().unwrap().clone();
    for cert in certs {
      let cert = cert.unwrap();
      assert!(Arc::ptr_eq(&first, &cert), "all callers share one certificate");
    }
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_cache_does_not_block_across_hosts() {
    let (dir, ca) = temp_ca("hosts").await;
    let cache = HostCertificateCache::new(ca.clone());
    let a = cache.get_or_create("a.example.com").await.unwrap();
    let b = cache.get_or_create("b.example.com").await.unwrap();
    assert_ne!(a.hostname(), b.hostname());
    assert_eq!(ca.issued_count(), 2);
    std::fs::remove_dir_all(&dir).ok();
  }
}
