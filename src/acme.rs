//! Automatic certificates via ACME (Let's Encrypt)
//!
//! Supports the TLS-ALPN-01 challenge (answered by [`CertStore`] on the proxy
//! listener) and HTTP-01 (answered by [`Http01Responder`] on a plaintext
//! listener). Account credentials and the issued certificate are cached
//! unencrypted in the cache directory; the key file is written 0600 on Unix.

use crate::config::AcmeChallengeType;
use crate::tls::{self, CertStore};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Renew when fewer days than this remain
const RENEW_BEFORE_DAYS: u64 = 30;
/// How often the certificate expiry is checked
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(60);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);
/// Polling attempts while waiting on the ACME server
const MAX_POLL_ATTEMPTS: u32 = 30;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Settings for one ACME certificate
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    /// Names on the certificate; the first is the common name
    pub domains: Vec<String>,
    pub email: String,
    pub directory_url: Option<String>,
    pub cache_dir: PathBuf,
    pub challenge: AcmeChallengeType,
}

/// Pending HTTP-01 challenge tokens
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.write().insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.read().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.inner.write().remove(token);
    }
}

/// Obtains and renews the listener certificate
pub struct AcmeManager {
    settings: AcmeSettings,
    store: Arc<CertStore>,
    http01: Http01Challenges,
}

impl AcmeManager {
    pub fn new(settings: AcmeSettings, store: Arc<CertStore>) -> anyhow::Result<Self> {
        if settings.domains.is_empty() {
            anyhow::bail!("ACME requires at least one domain");
        }
        std::fs::create_dir_all(&settings.cache_dir).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create ACME cache directory '{}': {}",
                settings.cache_dir.display(),
                e
            )
        })?;

        Ok(Self {
            settings,
            store,
            http01: Http01Challenges::new(),
        })
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.http01.clone()
    }

    /// Keep a valid certificate installed until shutdown.
    ///
    /// Failures are retried with exponential backoff; a cached certificate
    /// keeps serving in the meantime.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        if let Some(key) = self.load_cached_cert() {
            self.store.set_current(key);
        }

        let mut retry_delay = INITIAL_RETRY_DELAY;

        loop {
            let wait = if self.needs_renewal() {
                match self.renew().await {
                    Ok(()) => {
                        retry_delay = INITIAL_RETRY_DELAY;
                        RENEWAL_CHECK_INTERVAL
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            retry_in_secs = retry_delay.as_secs(),
                            "Failed to obtain certificate"
                        );
                        let wait = retry_delay;
                        retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                        wait
                    }
                }
            } else {
                RENEWAL_CHECK_INTERVAL
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("ACME manager shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn needs_renewal(&self) -> bool {
        self.store
            .current()
            .and_then(|key| {
                key.cert.first().map(|c| {
                    !is_cert_valid_for_days(c, RENEW_BEFORE_DAYS)
                        || !cert_covers_domains(c, &self.settings.domains)
                })
            })
            .unwrap_or(true)
    }

    async fn renew(&self) -> anyhow::Result<()> {
        let account = self.get_or_create_account().await?;
        let (certs, key, cert_pem, key_pem) = self.obtain_certificate(&account).await?;
        self.save_cert(&cert_pem, &key_pem)?;
        self.store.set_current(tls::certified_key(certs, &key)?);
        info!(domains = ?self.settings.domains, "Certificate installed");
        Ok(())
    }

    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.settings.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(email = %self.settings.email, "Creating ACME account");
        let directory_url = self
            .settings
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", self.settings.email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        std::fs::write(&account_path, serde_json::to_string_pretty(&credentials)?)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    fn load_cached_cert(&self) -> Option<Arc<CertifiedKey>> {
        let cert_path = self.settings.cache_dir.join("cert.pem");
        let key_path = self.settings.cache_dir.join("key.pem");
        if !cert_path.exists() || !key_path.exists() {
            return None;
        }

        match tls::load_certified_key(&cert_path, &key_path) {
            Ok(key) => {
                info!(path = %cert_path.display(), "Loaded cached certificate");
                Some(key)
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable cached certificate");
                None
            }
        }
    }

    fn save_cert(&self, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let cert_path = self.settings.cache_dir.join("cert.pem");
        let key_path = self.settings.cache_dir.join("key.pem");

        std::fs::write(&cert_path, cert_chain_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, private_key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, private_key_pem)?;
        }

        debug!(path = %cert_path.display(), "Certificate saved to cache");
        Ok(())
    }

    async fn obtain_certificate(
        &self,
        account: &Account,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, String, String)> {
        let identifiers: Vec<Identifier> = self
            .settings
            .domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        info!(domains = ?self.settings.domains, "Requesting certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge_type = match self.settings.challenge {
                AcmeChallengeType::Http01 => ChallengeType::Http01,
                AcmeChallengeType::TlsAlpn01 => ChallengeType::TlsAlpn01,
            };
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| {
                    anyhow::anyhow!("Challenge {:?} not offered for {}", challenge_type, domain)
                })?;

            let key_auth = order.key_authorization(challenge);
            match self.settings.challenge {
                AcmeChallengeType::Http01 => {
                    debug!(domain = %domain, token = %challenge.token, "Serving HTTP-01 challenge");
                    self.http01
                        .set(challenge.token.clone(), key_auth.as_str().to_string());
                }
                AcmeChallengeType::TlsAlpn01 => {
                    debug!(domain = %domain, "Serving TLS-ALPN-01 challenge");
                    let cert = tls_alpn01_cert(&domain, key_auth.digest().as_ref())?;
                    self.store.set_challenge(&domain, cert);
                }
            }

            order.set_challenge_ready(&challenge.url).await?;
            let result = wait_for_authorization(&mut order, &domain).await;

            match self.settings.challenge {
                AcmeChallengeType::Http01 => self.http01.remove(&challenge.token),
                AcmeChallengeType::TlsAlpn01 => self.store.remove_challenge(&domain),
            }
            result?;
        }

        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order invalid"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Order timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(self.settings.domains.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.settings.domains[0].clone());
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => anyhow::bail!("Order valid but no certificate returned"),
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("Unexpected order status: {:?}", status),
            }
        };

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .collect::<Result<_, _>>()?;
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        Ok((certs, key, cert_chain_pem, private_key.serialize_pem()))
    }
}

async fn wait_for_authorization(order: &mut instant_acme::Order, domain: &str) -> anyhow::Result<()> {
    for attempt in 1..=MAX_POLL_ATTEMPTS {
        tokio::time::sleep(POLL_INTERVAL).await;
        order.refresh().await?;

        let authorizations = order.authorizations().await?;
        let status = authorizations
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain))
            .map(|a| &a.status);

        match status {
            Some(AuthorizationStatus::Valid) => {
                info!(domain, "Authorization valid");
                return Ok(());
            }
            Some(AuthorizationStatus::Invalid) => anyhow::bail!("Authorization failed for {}", domain),
            Some(status) => debug!(domain, attempt, status = ?status, "Waiting for authorization"),
            None => anyhow::bail!("Authorization not found for {}", domain),
        }
    }
    anyhow::bail!("Authorization timeout for {}", domain)
}

/// Self-signed certificate carrying the acmeIdentifier extension
fn tls_alpn01_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params
        .custom_extensions
        .push(CustomExtension::new_acme_identifier(digest));

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    Ok(tls::certified_key(vec![cert.der().clone()], &key)?)
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let now = chrono::Utc::now().timestamp();
    let remaining_secs = parsed.validity().not_after.timestamp() - now;
    if remaining_secs < 0 {
        info!("Certificate has expired");
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(remaining_days, required_days = days, "Certificate expires soon");
        return false;
    }
    true
}

/// Whether every name in `domains` appears among the certificate's DNS SANs
fn cert_covers_domains(cert: &CertificateDer<'_>, domains: &[String]) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let names: Vec<String> = match parsed.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            error!(error = %e, "Failed to read subjectAltName");
            return false;
        }
    };

    let missing: Vec<&String> = domains
        .iter()
        .filter(|domain| !names.iter().any(|name| san_matches(name, domain)))
        .collect();
    if !missing.is_empty() {
        info!(missing = ?missing, "Certificate does not cover all domains");
        return false;
    }
    true
}

/// `*.example.com` matches exactly one extra label
fn san_matches(san: &str, domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    match san.strip_prefix("*.") {
        Some(suffix) => domain
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => san == domain,
    }
}

/// Plaintext listener answering HTTP-01 challenges and redirecting
/// everything else to HTTPS
pub struct Http01Responder {
    listener: TcpListener,
    challenges: Http01Challenges,
    https_port: u16,
}

impl Http01Responder {
    pub fn new(listener: TcpListener, challenges: Http01Challenges, https_port: u16) -> Self {
        Self {
            listener,
            challenges,
            https_port,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Failed to accept challenge connection");
                            continue;
                        }
                    };
                    let challenges = self.challenges.clone();
                    let https_port = self.https_port;
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let challenges = challenges.clone();
                            async move { Ok::<_, hyper::Error>(respond_http01(req, &challenges, https_port)) }
                        });
                        if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(addr = %addr, error = %e, "Challenge connection error");
                        }
                    });
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn respond_http01(
    req: Request<Incoming>,
    challenges: &Http01Challenges,
    https_port: u16,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req.uri().path();

    if let Some(key_auth) = path
        .strip_prefix(ACME_CHALLENGE_PREFIX)
        .and_then(|token| challenges.get(token))
    {
        debug!(path, "Responding to ACME HTTP-01 challenge");
        return Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(key_auth)).map_err(|never| match never {}).boxed())
            .expect("valid response builder");
    }

    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = if https_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, https_port, path_and_query)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> AcmeSettings {
        AcmeSettings {
            domains: vec!["example.com".to_string()],
            email: "admin@example.com".to_string(),
            directory_url: None,
            cache_dir: dir.join("acme"),
            challenge: AcmeChallengeType::TlsAlpn01,
        }
    }

    #[test]
    fn test_http01_challenges() {
        let challenges = Http01Challenges::new();
        challenges.set("token123".to_string(), "key_auth_123".to_string());

        assert_eq!(challenges.get("token123"), Some("key_auth_123".to_string()));
        assert_eq!(challenges.get("nonexistent"), None);

        challenges.remove("token123");
        assert_eq!(challenges.get("token123"), None);
    }

    #[test]
    fn test_manager_creates_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AcmeManager::new(settings(dir.path()), Arc::new(CertStore::new())).unwrap();

        assert!(dir.path().join("acme").is_dir());
        assert!(manager.needs_renewal());
    }

    #[test]
    fn test_manager_requires_domain() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.domains.clear();
        assert!(AcmeManager::new(settings, Arc::new(CertStore::new())).is_err());
    }

    #[test]
    fn test_cached_cert_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AcmeManager::new(settings(dir.path()), Arc::new(CertStore::new())).unwrap();

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        manager.save_cert(&cert.pem(), &key_pair.serialize_pem()).unwrap();

        assert!(manager.load_cached_cert().is_some());
    }

    #[test]
    fn test_fresh_self_signed_cert_is_not_due_for_renewal() {
        // rcgen's default validity runs until 4096
        let rcgen::CertifiedKey { cert, .. } =
            rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        assert!(is_cert_valid_for_days(cert.der(), RENEW_BEFORE_DAYS));
    }

    #[test]
    fn test_cached_cert_missing_a_domain_is_renewed() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.domains.push("sonarr.example.com".to_string());
        let store = Arc::new(CertStore::new());
        let manager = AcmeManager::new(settings, Arc::clone(&store)).unwrap();

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        manager.save_cert(&cert.pem(), &key_pair.serialize_pem()).unwrap();
        store.set_current(manager.load_cached_cert().unwrap());

        assert!(manager.needs_renewal());
    }

    #[test]
    fn test_cached_cert_covering_all_domains_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.domains.push("sonarr.example.com".to_string());
        let store = Arc::new(CertStore::new());
        let manager = AcmeManager::new(settings, Arc::clone(&store)).unwrap();

        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![
            "example.com".to_string(),
            "sonarr.example.com".to_string(),
        ])
        .unwrap();
        manager.save_cert(&cert.pem(), &key_pair.serialize_pem()).unwrap();
        store.set_current(manager.load_cached_cert().unwrap());

        assert!(!manager.needs_renewal());
    }

    #[test]
    fn test_san_matches() {
        assert!(san_matches("example.com", "Example.com"));
        assert!(san_matches("*.example.com", "sonarr.example.com"));
        assert!(!san_matches("*.example.com", "example.com"));
        assert!(!san_matches("*.example.com", "a.b.example.com"));
        assert!(!san_matches("example.com", "sonarr.example.com"));
    }

    #[test]
    fn test_tls_alpn01_cert_builds() {
        let digest = [7u8; 32];
        let key = tls_alpn01_cert("example.com", &digest).unwrap();
        assert_eq!(key.cert.len(), 1);
    }
}
