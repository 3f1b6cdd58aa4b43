//! Certificate manager for the TLS listener
//!
//! Certificates are picked per connection from the SNI server name. Only
//! hosts on the whitelist get one. Material is read from the cache directory
//! (`<host>.crt` / `<host>.key`, as an ACME client would leave it); a host
//! with nothing cached gets a self-signed certificate that is written back to
//! the cache. HTTP-01 challenge tokens are answered from memory or from
//! `<token>+http-01` files in the same directory.

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Hosts that may be served a certificate
#[derive(Debug, Clone, Default)]
pub struct HostPolicy {
    hosts: HashSet<String>,
}

impl HostPolicy {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| Self::normalize(h.as_ref()))
                .collect(),
        }
    }

    pub fn allows(&self, host: &str) -> bool {
        self.hosts.contains(&Self::normalize(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    fn normalize(host: &str) -> String {
        host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase()
    }
}

/// Certificate manager for handling SSL certificates
pub struct CertificateManager {
    cache_dir: PathBuf,
    policy: HostPolicy,
    certs: DashMap<String, Arc<CertifiedKey>>,
    // One lock per host, held while its certificate is loaded or generated
    loading: DashMap<String, Arc<Mutex<()>>>,
    acme_challenges: DashMap<String, String>,
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("cache_dir", &self.cache_dir)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CertificateManager {
    /// Create a new certificate manager, creating the cache directory
    pub fn new<P: AsRef<Path>>(cache_dir: P, policy: HostPolicy) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir).with_context(|| {
            format!("Failed to create certificate cache {}", cache_dir.display())
        })?;

        Ok(Self {
            cache_dir,
            policy,
            certs: DashMap::new(),
            loading: DashMap::new(),
            acme_challenges: DashMap::new(),
        })
    }

    pub fn policy(&self) -> &HostPolicy {
        &self.policy
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// rustls configuration for the TLS listener, resolving through `self`
    pub fn server_config(self: &Arc<Self>) -> ServerConfig {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }

    /// Certificate for a whitelisted host: memory, then cache, then self-signed
    pub fn certified_key(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let host = HostPolicy::normalize(host);

        if let Some(key) = self.certs.get(&host) {
            return Ok(key.clone());
        }

        let lock = self.loading.entry(host.clone()).or_default().clone();
        let _guard = lock.lock();

        // Another caller may have finished while we waited
        if let Some(key) = self.certs.get(&host) {
            return Ok(key.clone());
        }

        let key = match self.load_cached(&host)? {
            Some(key) => key,
            None => self.generate_self_signed(&host, &[host.as_str()])?,
        };

        self.certs.insert(host, key.clone());
        Ok(key)
    }

    /// Load every whitelisted host's certificate ahead of the first handshake
    pub fn warm(&self) {
        for host in self.policy.iter() {
            if let Err(e) = self.certified_key(host) {
                warn!("Failed to prepare certificate for {}: {:#}", host, e);
            }
        }
        info!("Prepared certificates for {} hosts", self.certs.len());
    }

    /// Load `<host>.crt` and `<host>.key` from the cache, if both exist
    fn load_cached(&self, host: &str) -> Result<Option<Arc<CertifiedKey>>> {
        let (cert_path, key_path) = self.cert_paths(host);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read(&cert_path)
            .with_context(|| format!("Failed to read {}", cert_path.display()))?;
        let key_pem = fs::read(&key_path)
            .with_context(|| format!("Failed to read {}", key_path.display()))?;

        let key = Self::parse_pem(&cert_pem, &key_pem)
            .with_context(|| format!("Invalid cached certificate for {}", host))?;

        debug!("Loaded cached certificate for {}", host);
        Ok(Some(key))
    }

    fn parse_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>> {
        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .context("Invalid certificate PEM")?;
        if chain.is_empty() {
            return Err(anyhow!("No certificate found"));
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("Invalid private key PEM")?
            .ok_or_else(|| anyhow!("No private key found"))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow!("Unsupported private key: {}", e))?;

        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }

    /// Generate a self-signed certificate and store it in the cache
    pub fn generate_self_signed(&self, domain: &str, san: &[&str]) -> Result<Arc<CertifiedKey>> {
        let subject_alt_names: Vec<String> = san.iter().map(|s| s.to_string()).collect();

        let cert = generate_simple_self_signed(subject_alt_names)?;

        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();
        let key = Self::parse_pem(cert_pem.as_bytes(), key_pem.as_bytes())?;

        let (cert_path, key_path) = self.cert_paths(domain);
        self.write_atomic(&key_path, key_pem.as_bytes())?;
        self.write_atomic(&cert_path, cert_pem.as_bytes())?;

        info!("Generated self-signed certificate for: {}", domain);

        Ok(key)
    }

    /// Write through a temp file in the cache dir so readers never see a partial file
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut file = NamedTempFile::new_in(&self.cache_dir).with_context(|| {
            format!("Failed to create temp file in {}", self.cache_dir.display())
        })?;
        file.write_all(contents)?;
        file.persist(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn cert_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let name = Self::sanitize_domain(domain);
        (
            self.cache_dir.join(format!("{}.crt", name)),
            self.cache_dir.join(format!("{}.key", name)),
        )
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain.replace('*', "wildcard")
    }

    /// Store ACME challenge token
    pub fn store_acme_challenge(&self, token: &str, key_authorization: &str) {
        self.acme_challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Get ACME challenge response, from memory or the cache directory
    pub fn get_acme_challenge(&self, token: &str) -> Option<String> {
        if !Self::is_valid_token(token) {
            return None;
        }

        if let Some(key_auth) = self.acme_challenges.get(token) {
            return Some(key_auth.clone());
        }

        let path = self.cache_dir.join(format!("{}+http-01", token));
        fs::read_to_string(path).ok().map(|s| s.trim_end().to_string())
    }

    /// Tokens are URL-safe base64
    fn is_valid_token(token: &str) -> bool {
        !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

// Runs on the handshake task. A cache miss reads, generates and writes files
// inline; `warm` does that at startup so handshakes normally hit memory.
impl ResolvesServerCert for CertificateManager {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("TLS handshake without server name");
            return None;
        };

        if !self.policy.allows(server_name) {
            warn!("Rejecting TLS handshake for host not in policy: {}", server_name);
            return None;
        }

        match self.certified_key(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("No certificate for {}: {:#}", server_name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_host_policy() {
        let policy = HostPolicy::new(["a.example", "WWW.A.Example"]);

        assert_eq!(policy.len(), 2);
        assert!(policy.allows("a.example"));
        assert!(policy.allows("A.EXAMPLE."));
        assert!(policy.allows("www.a.example"));
        assert!(!policy.allows("b.example"));
        assert!(!HostPolicy::default().allows("a.example"));
    }

    #[test]
    fn test_new_creates_cache_dir() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("nested").join("certs");

        let manager = CertificateManager::new(&cache, HostPolicy::default()).unwrap();
        assert!(cache.is_dir());
        assert_eq!(manager.cache_dir(), cache.as_path());
    }

    #[test]
    fn test_generate_self_signed() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(dir.path(), HostPolicy::default()).unwrap();

        manager
            .generate_self_signed("example.com", &["example.com", "www.example.com"])
            .unwrap();

        assert!(dir.path().join("example.com.crt").exists());
        assert!(dir.path().join("example.com.key").exists());
    }

    #[test]
    fn test_certified_key_is_generated_then_cached() {
        let dir = tempdir().unwrap();
        let manager =
            CertificateManager::new(dir.path(), HostPolicy::new(["a.example"])).unwrap();

        let first = manager.certified_key("a.example").unwrap();
        assert!(dir.path().join("a.example.crt").exists());
        assert!(dir.path().join("a.example.key").exists());
        assert_eq!(first.cert.len(), 1);

        let second = manager.certified_key("A.Example").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_certified_key_reads_existing_cache() {
        let dir = tempdir().unwrap();
        let writer = CertificateManager::new(dir.path(), HostPolicy::default()).unwrap();
        writer
            .generate_self_signed("a.example", &["a.example"])
            .unwrap();
        let cert_pem = fs::read(dir.path().join("a.example.crt")).unwrap();

        let reader =
            CertificateManager::new(dir.path(), HostPolicy::new(["a.example"])).unwrap();
        let key = reader.certified_key("a.example").unwrap();

        let expected = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(key.cert[0], expected);
        assert_eq!(fs::read(dir.path().join("a.example.crt")).unwrap(), cert_pem);
    }

    #[test]
    fn test_corrupt_cache_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.example.crt"), "not a certificate").unwrap();
        fs::write(dir.path().join("a.example.key"), "not a key").unwrap();

        let manager =
            CertificateManager::new(dir.path(), HostPolicy::new(["a.example"])).unwrap();
        assert!(manager.certified_key("a.example").is_err());
    }

    #[test]
    fn test_concurrent_first_resolves_share_one_certificate() {
        for _ in 0..20 {
            let dir = tempdir().unwrap();
            let manager = Arc::new(
                CertificateManager::new(dir.path(), HostPolicy::new(["a.example"])).unwrap(),
            );
            let barrier = Barrier::new(8);

            let keys: Vec<Arc<CertifiedKey>> = thread::scope(|s| {
                let handles: Vec<_> = (0..8)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            manager.certified_key("a.example").unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            for key in &keys[1..] {
                assert!(Arc::ptr_eq(&keys[0], key));
            }

            // What is on disk is the pair that is being served
            let reloaded = CertificateManager::new(dir.path(), HostPolicy::default())
                .unwrap()
                .load_cached("a.example")
                .unwrap()
                .unwrap();
            assert_eq!(reloaded.cert, keys[0].cert);
        }
    }

    #[test]
    fn test_warm_prepares_policy_hosts() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(
            dir.path(),
            HostPolicy::new(["a.example", "www.a.example"]),
        )
        .unwrap();

        manager.warm();

        assert!(dir.path().join("a.example.crt").exists());
        assert!(dir.path().join("www.a.example.key").exists());
        let cached = manager.certified_key("www.a.example").unwrap();
        assert!(Arc::ptr_eq(&cached, &manager.certified_key("WWW.a.example").unwrap()));
    }

    #[test]
    fn test_sanitize_domain() {
        assert_eq!(CertificateManager::sanitize_domain("example.com"), "example.com");
        assert_eq!(
            CertificateManager::sanitize_domain("*.example.com"),
            "wildcard.example.com"
        );
    }

    #[test]
    fn test_acme_challenge_storage() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(dir.path(), HostPolicy::default()).unwrap();

        manager.store_acme_challenge("token123", "key_auth_value");

        let result = manager.get_acme_challenge("token123");
        assert_eq!(result, Some("key_auth_value".to_string()));
        assert!(manager.get_acme_challenge("token456").is_none());
    }

    #[test]
    fn test_acme_challenge_from_cache_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tok-En_1+http-01"), "tok-En_1.thumbprint\n").unwrap();
        let manager = CertificateManager::new(dir.path(), HostPolicy::default()).unwrap();

        assert_eq!(
            manager.get_acme_challenge("tok-En_1"),
            Some("tok-En_1.thumbprint".to_string())
        );
    }

    #[test]
    fn test_acme_challenge_rejects_path_tokens() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(dir.path(), HostPolicy::default()).unwrap();

        assert!(manager.get_acme_challenge("../secret").is_none());
        assert!(manager.get_acme_challenge("").is_none());
    }
}
