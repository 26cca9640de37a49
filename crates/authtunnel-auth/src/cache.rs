//! JWT caches keyed by proxy

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("expired")]
    Expired,

    #[error("invalid")]
    Invalid,

    #[error("not found")]
    NotFound,

    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Misses, expired and malformed entries mean "log in again", not failure
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            CacheError::Expired | CacheError::Invalid | CacheError::NotFound
        )
    }
}

/// Stores raw JWTs by key.
///
/// Implementations serialize concurrent access themselves; several tunnel
/// sessions may share one cache.
pub trait JwtCache: Send + Sync {
    /// Load the token for `key`, checking its `exp` claim
    fn load_jwt(&self, key: &str) -> Result<String, CacheError>;

    fn store_jwt(&self, key: &str, raw_jwt: &str) -> Result<(), CacheError>;

    /// Delete the token for `key`; deleting a missing entry succeeds
    fn delete_jwt(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process cache
#[derive(Debug, Default)]
pub struct MemoryJwtCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryJwtCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JwtCache for MemoryJwtCache {
    fn load_jwt(&self, key: &str) -> Result<String, CacheError> {
        let raw_jwt = self.entries().get(key).cloned().ok_or(CacheError::NotFound)?;
        check_expiry(&raw_jwt)?;
        Ok(raw_jwt)
    }

    fn store_jwt(&self, key: &str, raw_jwt: &str) -> Result<(), CacheError> {
        self.entries().insert(key.to_string(), raw_jwt.to_string());
        Ok(())
    }

    fn delete_jwt(&self, key: &str) -> Result<(), CacheError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// One file per key in a cache directory
#[derive(Debug, Clone)]
pub struct LocalJwtCache {
    dir: PathBuf,
}

impl LocalJwtCache {
    /// Cache under `<user cache dir>/authtunnel/jwts`
    pub fn new() -> Result<Self, CacheError> {
        let dir = dirs::cache_dir()
            .ok_or_else(|| {
                CacheError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no user cache directory",
                ))
            })?
            .join("authtunnel")
            .join("jwts");
        Self::with_dir(dir)
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.jwt", name))
    }
}

impl JwtCache for LocalJwtCache {
    fn load_jwt(&self, key: &str) -> Result<String, CacheError> {
        let raw_jwt = match fs::read_to_string(self.path(key)) {
            Ok(raw_jwt) => raw_jwt,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(e) => return Err(e.into()),
        };
        check_expiry(&raw_jwt)?;
        Ok(raw_jwt)
    }

    fn store_jwt(&self, key: &str, raw_jwt: &str) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        write_private(&self.path(key), raw_jwt.as_bytes())?;
        debug!("Stored JWT in {}", self.dir.display());
        Ok(())
    }

    fn delete_jwt(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // an existing file keeps its old mode otherwise
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)
}

/// The on-disk cache when a cache directory is usable, else an in-memory one
pub fn default_cache() -> Arc<dyn JwtCache> {
    match LocalJwtCache::new() {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!("Error creating local JWT cache, using in-memory JWT cache: {}", e);
            Arc::new(MemoryJwtCache::new())
        }
    }
}

#[derive(Deserialize)]
struct Claims {
    #[serde(rename = "exp")]
    _exp: Option<u64>,
}

/// Validate the compact JWS shape and the `exp` claim without verifying
/// the signature.
fn check_expiry(raw_jwt: &str) -> Result<(), CacheError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.required_spec_claims.clear();
    validation.validate_aud = false;
    validation.validate_exp = true;
    validation.leeway = 0;

    match decode::<Claims>(raw_jwt.trim(), &DecodingKey::from_secret(&[]), &validation) {
        Ok(_) => Ok(()),
        Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => Err(CacheError::Expired),
        Err(e) => {
            debug!("Cached JWT is invalid: {}", e);
            Err(CacheError::Invalid)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Compact JWS carrying the given JSON claims
    pub(crate) fn token_with_claims(claims: &str) -> String {
        let claims: serde_json::Value = serde_json::from_str(claims).unwrap();
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"proxy-signing-key"),
        )
        .unwrap()
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn test_check_expiry() {
        let valid = token_with_claims(&format!(r#"{{"exp":{}}}"#, unix_now() + 3600));
        assert!(check_expiry(&valid).is_ok());

        let no_exp = token_with_claims(r#"{"sub":"user"}"#);
        assert!(check_expiry(&no_exp).is_ok());

        let expired = token_with_claims(&format!(r#"{{"exp":{}}}"#, unix_now() - 60));
        assert!(matches!(check_expiry(&expired), Err(CacheError::Expired)));

        assert!(matches!(check_expiry("not a jwt"), Err(CacheError::Invalid)));
        assert!(matches!(check_expiry("a.b.c"), Err(CacheError::Invalid)));
        assert!(check_expiry(&format!("{}\n", valid)).is_ok());
        assert!(matches!(
            check_expiry(&token_with_claims(r#"{"exp":"tomorrow"}"#)),
            Err(CacheError::Invalid)
        ));
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryJwtCache::new();
        let token = token_with_claims(r#"{"sub":"user"}"#);

        assert!(matches!(cache.load_jwt("key"), Err(CacheError::NotFound)));
        cache.store_jwt("key", &token).unwrap();
        assert_eq!(cache.load_jwt("key").unwrap(), token);
        assert!(matches!(cache.load_jwt("other"), Err(CacheError::NotFound)));

        cache.delete_jwt("key").unwrap();
        assert!(matches!(cache.load_jwt("key"), Err(CacheError::NotFound)));
        cache.delete_jwt("key").unwrap();
    }

    #[test]
    fn test_memory_cache_keeps_expired_entries() {
        let cache = MemoryJwtCache::new();
        let expired = token_with_claims(&format!(r#"{{"exp":{}}}"#, unix_now() - 60));
        cache.store_jwt("key", &expired).unwrap();

        assert!(matches!(cache.load_jwt("key"), Err(CacheError::Expired)));
        assert!(matches!(cache.load_jwt("key"), Err(CacheError::Expired)));
    }

    #[test]
    fn test_local_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalJwtCache::with_dir(dir.path().join("jwts")).unwrap();
        let token = token_with_claims(r#"{"sub":"user"}"#);

        assert!(matches!(cache.load_jwt("proxy:443|true"), Err(CacheError::NotFound)));
        cache.store_jwt("proxy:443|true", &token).unwrap();
        assert_eq!(cache.load_jwt("proxy:443|true").unwrap(), token);
        assert!(matches!(cache.load_jwt("proxy:443|false"), Err(CacheError::NotFound)));

        // survives a new instance over the same directory
        let reopened = LocalJwtCache::with_dir(cache.dir()).unwrap();
        assert_eq!(reopened.load_jwt("proxy:443|true").unwrap(), token);

        cache.delete_jwt("proxy:443|true").unwrap();
        assert!(matches!(reopened.load_jwt("proxy:443|true"), Err(CacheError::NotFound)));
        cache.delete_jwt("proxy:443|true").unwrap();
    }

    #[test]
    fn test_local_cache_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalJwtCache::with_dir(dir.path()).unwrap();
        cache.store_jwt("key", "garbage").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".jwt"));
        assert_eq!(names[0].len(), 64 + 4);
        assert!(!names[0].contains("key"));

        assert!(matches!(cache.load_jwt("key"), Err(CacheError::Invalid)));
    }

    #[cfg(unix)]
    #[test]
    fn test_local_cache_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = LocalJwtCache::with_dir(dir.path()).unwrap();
        cache.store_jwt("key", "token").unwrap();

        let mode = fs::metadata(cache.path("key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_cache_errors_that_mean_miss() {
        assert!(CacheError::Expired.is_miss());
        assert!(CacheError::Invalid.is_miss());
        assert!(CacheError::NotFound.is_miss());
        assert!(!CacheError::Io(io::Error::other("disk")).is_miss());
    }
}
