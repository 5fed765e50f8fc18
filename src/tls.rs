//! Certificate storage and static certificate loading
//!
//! [`CertStore`] is the rustls certificate resolver for the proxy listener.
//! Its material is swapped atomically: a handshake that already resolved the
//! old key keeps its `Arc`, new handshakes see the new one.

use crate::error::{Error, Result};
use arc_swap::ArcSwapOption;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// ALPN protocol used by the ACME TLS-ALPN-01 challenge
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Current certificate plus pending TLS-ALPN-01 challenge certificates
#[derive(Default)]
pub struct CertStore {
    current: ArcSwapOption<CertifiedKey>,
    challenges: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("has_certificate", &self.has_certificate())
            .field("challenges", &self.challenges.read().len())
            .finish()
    }
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current(&self, key: Arc<CertifiedKey>) {
        self.current.store(Some(key));
    }

    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }

    pub fn has_certificate(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn set_challenge(&self, domain: &str, key: Arc<CertifiedKey>) {
        self.challenges.write().insert(domain.to_ascii_lowercase(), key);
    }

    pub fn remove_challenge(&self, domain: &str) {
        self.challenges.write().remove(&domain.to_ascii_lowercase());
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let is_acme_challenge = client_hello
            .alpn()
            .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);

        if is_acme_challenge {
            let sni = client_hello.server_name()?.to_ascii_lowercase();
            return self.challenges.read().get(&sni).cloned();
        }

        self.current()
    }
}

/// TLS acceptor resolving certificates through `store`
pub fn acceptor(store: Arc<CertStore>, acme_alpn: bool) -> Result<TlsAcceptor> {
    // Explicit provider; the process default may be unset or ambiguous
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("unsupported protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(store);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    if acme_alpn {
        config.alpn_protocols.push(ACME_TLS_ALPN_NAME.to_vec());
    }

    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Tls(format!("failed to open certificate file {}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Tls(format!("failed to parse certificates from {}: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("failed to open key file {}: {}", path.display(), e)))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("failed to parse key from {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Pair a certificate chain with its signing key
pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| Error::Tls(format!("unsupported private key: {}", e)))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Load a certificate chain and key from PEM files
pub fn load_certified_key(cert: &Path, key: &Path) -> Result<Arc<CertifiedKey>> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    certified_key(certs, &key)
}

/// Reloads static certificate files into a [`CertStore`] when they change.
///
/// The parent directories are watched rather than the files so that
/// replace-by-rename (certbot, editors) is picked up. A reload that fails
/// keeps the previous certificate.
pub struct CertWatcher {
    _watcher: RecommendedWatcher,
}

impl CertWatcher {
    pub fn spawn(cert: PathBuf, key: PathBuf, store: Arc<CertStore>) -> Result<Self> {
        let watched = [cert.clone(), key.clone()];
        let (cert_path, key_path) = (cert.clone(), key.clone());

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event.paths.iter().any(|p| watched.iter().any(|w| same_file(p, w)));
                    if !relevant {
                        return;
                    }
                    debug!(paths = ?event.paths, "Certificate file change detected");
                    match load_certified_key(&cert_path, &key_path) {
                        Ok(key) => {
                            store.set_current(key);
                            info!(cert = %cert_path.display(), "Certificate reloaded");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload certificate, keeping current one");
                        }
                    }
                }
                Err(e) => error!(error = ?e, "Certificate watch error"),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Tls(format!("failed to watch certificate files: {}", e)))?;

        let mut dirs: Vec<PathBuf> = [&cert, &key]
            .iter()
            .map(|p| parent_dir(p))
            .collect();
        dirs.dedup();
        for dir in &dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| Error::Tls(format!("failed to watch {}: {}", dir.display(), e)))?;
        }

        info!(cert = %cert.display(), key = %key.display(), "Watching certificate files");
        Ok(Self { _watcher: watcher })
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn same_file(event_path: &Path, watched: &Path) -> bool {
    if event_path == watched {
        return true;
    }
    // Events carry absolute paths; the config may not
    match (event_path.file_name(), watched.file_name()) {
        (Some(a), Some(b)) if a == b => {
            let watched_abs = std::fs::canonicalize(parent_dir(watched)).ok();
            let event_dir = event_path.parent().and_then(|p| std::fs::canonicalize(p).ok());
            watched_abs.is_some() && watched_abs == event_dir
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_self_signed(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_load_certified_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "localhost");

        let certified = load_certified_key(&cert, &key).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_certified_key(&dir.path().join("nope.pem"), &dir.path().join("nope.key"))
            .unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        assert!(load_certs(&cert).is_err());
        assert!(load_key(&key).is_err());
    }

    #[test]
    fn test_store_swap_keeps_old_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "a.example.com");
        let first = load_certified_key(&cert, &key).unwrap();

        let store = CertStore::new();
        assert!(!store.has_certificate());
        store.set_current(Arc::clone(&first));

        let held = store.current().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "b.example.com");
        store.set_current(load_certified_key(&cert, &key).unwrap());

        assert!(Arc::ptr_eq(&held, &first));
        assert!(!Arc::ptr_eq(&store.current().unwrap(), &first));
    }

    #[test]
    fn test_challenge_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "example.com");
        let store = CertStore::new();

        store.set_challenge("Example.com", load_certified_key(&cert, &key).unwrap());
        assert_eq!(store.challenges.read().len(), 1);
        store.remove_challenge("example.com");
        assert!(store.challenges.read().is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reloads_changed_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "one.example.com");
        let store = Arc::new(CertStore::new());
        let initial = load_certified_key(&cert, &key).unwrap();
        store.set_current(Arc::clone(&initial));

        let _watcher = CertWatcher::spawn(cert.clone(), key.clone(), Arc::clone(&store)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        write_self_signed(dir.path(), "two.example.com");

        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !Arc::ptr_eq(&store.current().unwrap(), &initial) {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "certificate was not reloaded");
    }
}
