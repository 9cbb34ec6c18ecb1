// Trust Evaluator (spec.md §4.1) and a concrete trust store backing it
// (SPEC_FULL.md §10.6).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use relayforge_common::{CertAuthority, CertRole, Error, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// The external collaborator spec.md §6 calls "trust store": enumerates
/// certificate authorities for a role. The core only consumes this
/// interface; its implementation is ambient infrastructure.
pub trait TrustStore: Send + Sync {
    fn get_cert_authorities(&self, role: CertRole) -> Result<Vec<CertAuthority>>;
}

/// Stateless decision function over a `TrustStore` (spec.md §4.1).
pub struct TrustEvaluator {
    store: Arc<dyn TrustStore>,
}

impl TrustEvaluator {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }

    pub fn is_host_authority(&self, key: &[u8]) -> bool {
        self.is_authority(CertRole::Host, key)
    }

    pub fn is_user_authority(&self, key: &[u8]) -> bool {
        self.is_authority(CertRole::User, key)
    }

    fn is_authority(&self, role: CertRole, key: &[u8]) -> bool {
        match self.store.get_cert_authorities(role) {
            Ok(cas) => cas
                .iter()
                .flat_map(|ca| ca.checkers.iter())
                .any(|checker| checker.as_slice() == key),
            Err(e) => {
                warn!("trust store error evaluating {} authority: {}", role, e);
                false
            }
        }
    }

    /// Restricted to CAs whose domain equals `domain`, so a cluster we
    /// trust under one name cannot forge a certificate for another.
    pub fn check_trusted_key(&self, role: CertRole, domain: &str, key: &[u8]) -> Result<()> {
        let cas = match self.store.get_cert_authorities(role) {
            Ok(cas) => cas,
            Err(e) => {
                warn!("trust store error checking domain {}: {}", domain, e);
                return Err(Error::not_found(format!(
                    "trust store unavailable for domain {}",
                    domain
                )));
            }
        };

        let trusted = cas
            .iter()
            .filter(|ca| ca.domain == domain)
            .flat_map(|ca| ca.checkers.iter())
            .any(|checker| checker.as_slice() == key);

        if trusted {
            Ok(())
        } else {
            Err(Error::not_found(format!(
                "no trusted signer for domain {}",
                domain
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CaFile {
    domain: String,
    role: CertRole,
    #[serde(default)]
    checkers: Vec<String>,
}

/// A directory of per-authority-domain TOML files, one CA record each.
/// Loaded eagerly; the in-memory snapshot is swapped atomically on reload,
/// so lookups never observe a half-written directory.
pub struct FileTrustStore {
    path: PathBuf,
    snapshot: RwLock<Arc<HashMap<CertRole, Vec<CertAuthority>>>>,
}

impl FileTrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Re-read every `*.toml` file under the trust store directory.
    pub fn reload(&self) -> Result<()> {
        let mut by_role: HashMap<CertRole, Vec<CertAuthority>> = HashMap::new();

        if !self.path.exists() {
            debug!(
                "trust store directory {} does not exist yet, treating as empty",
                self.path.display()
            );
            *self.snapshot.write().unwrap() = Arc::new(by_role);
            return Ok(());
        }

        let entries = fs::read_dir(&self.path).map_err(Error::Io)?;
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let ca = Self::load_one(&path)?;
            by_role.entry(ca.role).or_default().push(ca);
        }

        info_loaded(&by_role);
        *self.snapshot.write().unwrap() = Arc::new(by_role);
        Ok(())
    }

    fn load_one(path: &Path) -> Result<CertAuthority> {
        let contents = fs::read_to_string(path).map_err(Error::Io)?;
        let file: CaFile = toml::from_str(&contents)
            .map_err(|e| Error::bad_parameter(format!("{}: {}", path.display(), e)))?;

        let checkers = file
            .checkers
            .iter()
            .map(|encoded| {
                BASE64
                    .decode(encoded)
                    .map_err(|e| Error::bad_parameter(format!("{}: bad checker key: {}", path.display(), e)))
            })
            .collect::<Result<Vec<Vec<u8>>>>()?;

        Ok(CertAuthority {
            domain: file.domain,
            role: file.role,
            checkers,
        })
    }
}

fn info_loaded(by_role: &HashMap<CertRole, Vec<CertAuthority>>) {
    let total: usize = by_role.values().map(|v| v.len()).sum();
    debug!("trust store reloaded: {} CA record(s)", total);
}

impl TrustStore for FileTrustStore {
    fn get_cert_authorities(&self, role: CertRole) -> Result<Vec<CertAuthority>> {
        let snapshot = self.snapshot.read().unwrap();
        Ok(snapshot.get(&role).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_ca_file(dir: &Path, name: &str, domain: &str, role: &str, checkers: &[&str]) {
        let checkers_toml = checkers
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let contents = format!(
            "domain = \"{}\"\nrole = \"{}\"\ncheckers = [{}]\n",
            domain, role, checkers_toml
        );
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn loads_host_and_user_cas_separately() {
        let dir = TempDir::new().unwrap();
        let key_a = BASE64.encode(b"key-a");
        let key_b = BASE64.encode(b"key-b");
        write_ca_file(dir.path(), "east.toml", "east.example.com", "host", &[&key_a]);
        write_ca_file(dir.path(), "users.toml", "east.example.com", "user", &[&key_b]);

        let store = FileTrustStore::new(dir.path());
        store.reload().unwrap();

        let hosts = store.get_cert_authorities(CertRole::Host).unwrap();
        assert_eq!(hosts.len(), 1);
        let users = store.get_cert_authorities(CertRole::User).unwrap();
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn evaluator_is_host_authority_byte_equal() {
        let dir = TempDir::new().unwrap();
        let key = BASE64.encode(b"signer-key-bytes");
        write_ca_file(dir.path(), "east.toml", "east.example.com", "host", &[&key]);

        let store = Arc::new(FileTrustStore::new(dir.path()));
        store.reload().unwrap();
        let evaluator = TrustEvaluator::new(store);

        assert!(evaluator.is_host_authority(b"signer-key-bytes"));
        assert!(!evaluator.is_host_authority(b"other-key-bytes"));
    }

    #[test]
    fn check_trusted_key_rejects_domain_mismatch() {
        // Spoofed-domain scenario (spec.md §8 seed 4): a CA we trust for
        // west.example.com must not vouch for east.example.com.
        let dir = TempDir::new().unwrap();
        let key = BASE64.encode(b"west-signer");
        write_ca_file(dir.path(), "west.toml", "west.example.com", "host", &[&key]);

        let store = Arc::new(FileTrustStore::new(dir.path()));
        store.reload().unwrap();
        let evaluator = TrustEvaluator::new(store);

        assert!(evaluator
            .check_trusted_key(CertRole::Host, "west.example.com", b"west-signer")
            .is_ok());
        assert!(evaluator
            .check_trusted_key(CertRole::Host, "east.example.com", b"west-signer")
            .is_err());
    }

    #[test]
    fn empty_trust_store_fails_closed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileTrustStore::new(dir.path()));
        store.reload().unwrap();
        let evaluator = TrustEvaluator::new(store);

        assert!(!evaluator.is_host_authority(b"anything"));
        assert!(evaluator
            .check_trusted_key(CertRole::Host, "east.example.com", b"anything")
            .is_err());
    }
}
