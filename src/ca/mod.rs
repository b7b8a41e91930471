//! Local certificate authority forging per-host leaf certificates.

mod pem;
pub mod store;

pub use store::{CertStore, DomainTrieStore, MemoryStore};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::{
    fmt,
    io::{self, Write},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use time::OffsetDateTime;
use tokio_rustls::rustls::{
    self,
    client::{danger::ServerCertVerifier, WebPkiServerVerifier},
    crypto::{ring, CryptoProvider},
    server::{ClientHello, ResolvesServerCert},
    sign::{CertifiedKey, SigningKey},
    RootCertStore, ServerConfig,
};

/// Common name of generated root certificates.
pub const ROOT_COMMON_NAME: &str = "vmitm Root CA";
/// Organization of generated root certificates.
pub const ROOT_ORGANIZATION: &str = "vmitm Trust Services";

const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(60 * 60);
const DEFAULT_LEAF_ORGANIZATION: &str = "vmitm";

/// Root lifetime for [`RootCa::generate_and_save`].
const SAVED_ROOT_NOT_BEFORE: Duration = Duration::from_secs(60 * 24 * 60 * 60);
const SAVED_ROOT_NOT_AFTER: Duration = Duration::from_secs(25 * 365 * 24 * 60 * 60);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Rcgen(#[from] rcgen::Error),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error(transparent)]
    Verifier(#[from] rustls::client::VerifierBuilderError),

    #[error(transparent)]
    Der(#[from] pkcs8::der::Error),

    #[error("no certificate found in {0}")]
    MissingCertificate(PathBuf),

    #[error("private key format not supported")]
    UnsupportedKey,
}

/// How wide a forged leaf is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeafScope {
    /// One leaf per hostname, SAN = hostname.
    #[default]
    Exact,
    /// One leaf per parent domain, SAN = hostname + `*.parent`.
    ///
    /// Pair with [`DomainTrieStore`] so siblings hit the same entry.
    Wildcard,
}

/// A root certificate together with its signing key.
pub struct RootCa {
    issuer: Issuer<'static, KeyPair>,
    der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl RootCa {
    /// Generate a new self-signed CA valid for `[now - validity, now + validity]`.
    pub fn create(name: &str, organization: &str, validity: Duration) -> Result<Self, Error> {
        let now = OffsetDateTime::now_utc();
        Self::build(name, organization, now - span(validity), now + span(validity))
    }

    fn build(
        name: &str,
        organization: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<Self, Error> {
        let key = KeyPair::generate_for(&PKCS_RSA_SHA256)?;

        let mut params = CertificateParams::default();
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, name);
        distinguished_name.push(DnType::OrganizationName, organization);
        params.distinguished_name = distinguished_name;
        params.serial_number = Some(SerialNumber::from(unix_now()));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.self_signed(&key)?;
        let der = cert.der().clone();
        let key_der = key.serialize_der();

        Ok(Self {
            issuer: Issuer::new(params, key),
            der,
            key_der,
        })
    }

    /// Generate a long-lived root and write it to `cert_path` / `key_path`.
    pub fn generate_and_save(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let now = OffsetDateTime::now_utc();
        let root = Self::build(
            ROOT_COMMON_NAME,
            ROOT_ORGANIZATION,
            now - span(SAVED_ROOT_NOT_BEFORE),
            now + span(SAVED_ROOT_NOT_AFTER),
        )?;
        root.save(cert_path, key_path)?;
        Ok(root)
    }

    /// Load a root from a PEM certificate and a PKCS#1 or PKCS#8 PEM key.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, Error> {
        let cert_path = cert_path.as_ref();
        let cert = std::fs::read(cert_path)?;
        let der = rustls_pemfile::certs(&mut cert.as_ref())
            .next()
            .ok_or_else(|| Error::MissingCertificate(cert_path.to_path_buf()))??;

        let key = std::fs::read(key_path.as_ref())?;
        let pkcs8 = match rustls_pemfile::read_one(&mut key.as_ref())? {
            Some(Item::Pkcs1Key(key)) => pem::pkcs1_to_pkcs8(key.secret_pkcs1_der())?,
            Some(Item::Pkcs8Key(key)) => key.secret_pkcs8_der().to_vec(),
            _ => return Err(Error::UnsupportedKey),
        };
        let key = KeyPair::try_from(pkcs8.as_slice())?;
        let issuer = Issuer::from_ca_cert_der(&der, key)?;

        Ok(Self {
            issuer,
            der,
            key_der: pkcs8,
        })
    }

    /// Reuse the root cached in `dir`, or generate and cache a new one.
    pub fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        if !dir.exists() {
            tracing::info!("Creating CA directory: {}", dir.display());
            std::fs::create_dir_all(dir)?;
        }

        let cert_path = dir.join("ca.crt");
        let key_path = dir.join("ca.key");
        if cert_path.exists() && key_path.exists() {
            tracing::info!("Using existing root certificate: {}", cert_path.display());
            return Self::load(cert_path, key_path);
        }

        tracing::info!("Generating root certificate: {}", cert_path.display());
        Self::generate_and_save(cert_path, key_path)
    }

    /// Write the certificate and key as PEM files readable only by the owner.
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> io::Result<()> {
        write_private(cert_path.as_ref(), self.pem().as_bytes())?;
        write_private(key_path.as_ref(), self.key_pem().as_bytes())
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn pem(&self) -> String {
        pem::encode("CERTIFICATE", &self.der)
    }

    /// The private key as `RSA PRIVATE KEY` (PKCS#1) PEM.
    pub fn key_pem(&self) -> String {
        match pem::pkcs8_to_pkcs1(&self.key_der) {
            Some(pkcs1) => pem::encode("RSA PRIVATE KEY", pkcs1),
            None => pem::encode("PRIVATE KEY", &self.key_der),
        }
    }
}

impl fmt::Debug for RootCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCa").finish()
    }
}

/// Signing context: issues, verifies and caches leaf certificates under one root.
pub struct Authority {
    root: RootCa,
    root_pem: String,
    leaf_key: KeyPair,
    signer: Arc<dyn SigningKey>,
    verifier: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
    store: Arc<dyn CertStore>,
    serial: AtomicU64,
    leaf_validity: Duration,
    organization: String,
    scope: LeafScope,
}

impl Authority {
    /// Create a signing context over `root`.
    ///
    /// One leaf key pair is generated here and shared by every leaf. With no
    /// `store` the flat [`MemoryStore`] is used.
    pub fn new(root: RootCa, store: Option<Arc<dyn CertStore>>) -> Result<Self, Error> {
        let provider = Arc::new(ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.add(root.der().clone())?;
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()?;

        let leaf_key = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
        let leaf_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signer = provider.key_provider.load_private_key(leaf_der)?;

        Ok(Self {
            root_pem: root.pem(),
            root,
            leaf_key,
            signer,
            verifier,
            provider,
            store: store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            serial: AtomicU64::new(unix_now()),
            leaf_validity: DEFAULT_LEAF_VALIDITY,
            organization: DEFAULT_LEAF_ORGANIZATION.to_owned(),
            scope: LeafScope::Exact,
        })
    }

    pub fn with_leaf_validity(mut self, validity: Duration) -> Self {
        self.leaf_validity = validity;
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    pub fn with_scope(mut self, scope: LeafScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn root(&self) -> &RootCa {
        &self.root
    }

    /// Root certificate as PEM, as served by the download endpoint.
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// Return a valid leaf for `hostname`, reusing the cached one if it still
    /// verifies against the root.
    pub fn get_or_create(
        &self,
        hostname: &str,
        extra_ips: &[IpAddr],
    ) -> Result<Arc<CertifiedKey>, Error> {
        let host = normalize_host(hostname);

        if let Some(cached) = self.store.get(&host) {
            if self.verify(&cached, &host) {
                return Ok(cached);
            }
            tracing::debug!("cached certificate for {} no longer verifies", host);
        }

        let (key, names) = self.leaf_names(&host);

        let mut params = CertificateParams::default();
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host.as_str());
        distinguished_name.push(DnType::OrganizationName, self.organization.as_str());
        params.distinguished_name = distinguished_name;
        params.serial_number = Some(SerialNumber::from(self.next_serial()));
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - span(self.leaf_validity);
        params.not_after = now + span(self.leaf_validity);

        match host.parse::<IpAddr>() {
            Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
            Err(_) => {
                for name in names {
                    params
                        .subject_alt_names
                        .push(SanType::DnsName(name.try_into()?));
                }
            }
        }
        for ip in extra_ips {
            let san = SanType::IpAddress(*ip);
            if !params.subject_alt_names.contains(&san) {
                params.subject_alt_names.push(san);
            }
        }

        let cert = params.signed_by(&self.leaf_key, &self.root.issuer)?;
        let certified = Arc::new(CertifiedKey::new(
            vec![cert.der().clone(), self.root.der().clone()],
            self.signer.clone(),
        ));

        tracing::debug!("issued certificate for {} (store key {})", host, key);
        self.store.set(key, certified.clone());
        Ok(certified)
    }

    /// TLS server configuration minting certificates from the client's SNI,
    /// falling back to `default_host` when SNI is absent.
    pub fn server_config_for_host(
        self: &Arc<Self>,
        default_host: &str,
    ) -> Result<Arc<ServerConfig>, Error> {
        let resolver = HostResolver {
            authority: self.clone(),
            default_host: normalize_host(default_host),
        };

        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    fn verify(&self, cert: &CertifiedKey, host: &str) -> bool {
        let Some((leaf, intermediates)) = cert.cert.split_first() else {
            return false;
        };
        let Ok(name) = ServerName::try_from(host) else {
            return false;
        };
        self.verifier
            .verify_server_cert(leaf, intermediates, &name, &[], UnixTime::now())
            .is_ok()
    }

    /// Store key and DNS names for a leaf covering `host`.
    fn leaf_names(&self, host: &str) -> (String, Vec<String>) {
        if self.scope == LeafScope::Exact || host.parse::<IpAddr>().is_ok() {
            return (host.to_owned(), vec![host.to_owned()]);
        }

        match host.split_once('.') {
            Some((_, parent)) if parent.contains('.') => {
                let wildcard = format!("*.{parent}");
                (wildcard.clone(), vec![host.to_owned(), wildcard])
            }
            _ => (
                format!("+.{host}"),
                vec![host.to_owned(), format!("*.{host}")],
            ),
        }
    }

    fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authority")
            .field("scope", &self.scope)
            .field("leaf_validity", &self.leaf_validity)
            .finish()
    }
}

#[derive(Debug)]
struct HostResolver {
    authority: Arc<Authority>,
    default_host: String,
}

impl ResolvesServerCert for HostResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .unwrap_or(self.default_host.as_str());

        match self.authority.get_or_create(host, &[]) {
            Ok(cert) => Some(cert),
            Err(err) => {
                tracing::warn!("failed to issue certificate for {}: {}", host, err);
                None
            }
        }
    }
}

/// Strip any port and IPv6 brackets, and lowercase DNS names.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if let Ok(addr) = host.parse::<std::net::SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner.to_owned();
    }
    if host.parse::<IpAddr>().is_ok() {
        return host.to_owned();
    }
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn span(duration: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX / 2))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.flush()
}
