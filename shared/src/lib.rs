#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod alpn;
pub mod cert;
pub mod content;
pub mod crypto;
pub mod io;
pub mod tls;
pub mod uri;
pub mod util;

use dashmap::DashMap;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, pem::PemObject};
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::crypto::init_crypto;

static ROXYMITM: &str = "roxymitm";

/// Root CA plus a per-host leaf cache. Concurrent misses for the same host
/// coalesce onto one signing operation via `leaf_locks` (single-flight).
#[derive(Debug, Clone)]
pub struct RoxyCA {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    issuer: Issuer<'static, KeyPair>,
    leaves: DashMap<String, (Certificate, KeyPair)>,
    leaf_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl RoxyCA {
    pub fn new(issuer: Issuer<'static, KeyPair>) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer,
                leaves: DashMap::new(),
                leaf_locks: DashMap::new(),
            }),
        }
    }

    pub fn key_pair(&self) -> &KeyPair {
        self.inner.issuer.key()
    }

    /// Returns the cached leaf for `host`, minting and caching one on first use.
    pub async fn leaf_for(&self, host: &str) -> Result<(Certificate, KeyPair), CaError> {
        if let Some(entry) = self.inner.leaves.get(host) {
            return Ok(clone_leaf(entry.value()));
        }

        let lock = self
            .inner
            .leaf_locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(entry) = self.inner.leaves.get(host) {
            return Ok(clone_leaf(entry.value()));
        }

        let leaf = self.sign_leaf(host)?;
        self.inner
            .leaves
            .insert(host.to_string(), clone_leaf(&leaf));
        Ok(leaf)
    }

    fn sign_leaf(&self, host: &str) -> Result<(Certificate, KeyPair), CaError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate()?;
        let leaf = params.signed_by(&key_pair, &self.inner.issuer)?;
        debug!("minted leaf cert for {host}");
        Ok((leaf, key_pair))
    }
}

fn clone_leaf(leaf: &(Certificate, KeyPair)) -> (Certificate, KeyPair) {
    (leaf.0.clone(), leaf.1.clone_key())
}

struct CaFiles {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CaFiles {
    fn new(dir: &Path) -> Self {
        CaFiles {
            cert_path: dir.join("ca.crt"),
            key_path: dir.join("ca.key"),
        }
    }
}

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    RustLSPem(rustls::pki_types::pem::Error),
}

impl Error for CaError {}

impl std::fmt::Display for CaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

impl From<rustls::pki_types::pem::Error> for CaError {
    fn from(value: rustls::pki_types::pem::Error) -> Self {
        CaError::RustLSPem(value)
    }
}

/// Loads the root CA from `dir` (`ca.crt` / `ca.key`), generating and persisting
/// one on first run. Fatal at startup on failure.
pub fn load_or_create_root(dir: &Path) -> Result<RoxyCA, CaError> {
    init_crypto();
    fs::create_dir_all(dir)?;
    let ca_files = CaFiles::new(dir);

    let issuer = if ca_files.cert_path.exists() && ca_files.key_path.exists() {
        trace!("loading existing root CA from {}", dir.display());
        let key_pem = fs::read_to_string(&ca_files.key_path)?;
        let key_pair = KeyPair::from_pem(&key_pem)?;
        let cert_pem = fs::read_to_string(&ca_files.cert_path)?;
        Issuer::from_ca_cert_pem(&cert_pem, key_pair)?
    } else {
        generate(&ca_files)?
    };

    Ok(RoxyCA::new(issuer))
}

fn generate(ca_files: &CaFiles) -> Result<Issuer<'static, KeyPair>, CaError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CountryName, "US");
    params.distinguished_name.push(DnType::CommonName, ROXYMITM);
    params
        .distinguished_name
        .push(DnType::OrganizationName, ROXYMITM);

    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(365 * 10));

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let ca_cert = params.self_signed(&key_pair)?;

    fs::write(&ca_files.cert_path, ca_cert.pem())?;
    write_key_file(&ca_files.key_path, &key_pair.serialize_pem())?;

    debug!("generated root CA at {}", ca_files.cert_path.display());
    Ok(Issuer::new(params, key_pair))
}

#[cfg(unix)]
fn write_key_file(path: &Path, pem: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    std::io::Write::write_all(&mut f, pem.as_bytes())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, pem: &str) -> std::io::Result<()> {
    fs::write(path, pem)
}

/// DER form of the root cert, for callers (e.g. a fingerprint sidecar) that want
/// to validate against the local root rather than skipping verification.
pub fn ca_cert_der(dir: &Path) -> Result<CertificateDer<'static>, CaError> {
    Ok(CertificateDer::from_pem_file(CaFiles::new(dir).cert_path)?)
}
