//! Credential store and rotation session.
//!
//! Keys live one per file somewhere under a key directory; any file whose
//! name starts with the store's prefix holds a single key on its first line.
//! A [`KeySession`] hands out the current key and advances past keys the
//! service reports as spent.

use crate::error::{FetchError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// File name prefix for Scopus API keys
pub const SCOPUS_KEY_PREFIX: &str = "elsevier_apikey_";

/// File name prefix for analytics warehouse bearer tokens
pub const WAREHOUSE_KEY_PREFIX: &str = "gbq_token_";

/// A single API key or bearer token.
///
/// `Debug` is redacted so keys never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    index: usize,
    secret: String,
}

impl Credential {
    /// Position of this credential in its pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// The raw key string
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Loads credential files from a key directory tree
pub struct KeyStore {
    root: PathBuf,
    prefix: String,
}

impl KeyStore {
    /// Create a store rooted at `root`, matching files that start with `prefix`
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Get the key directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the directory tree and return every key, ordered by file path.
    ///
    /// Fails if the directory is missing or holds no keys.
    pub fn load(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(FetchError::Config(format!(
                "Key directory not found: {}",
                self.root.display()
            )));
        }

        let mut files = Vec::new();
        collect_key_files(&self.root, &self.prefix, &mut files)?;
        files.sort();

        let mut keys = Vec::with_capacity(files.len());
        for path in &files {
            let content = std::fs::read_to_string(path)?;
            let key = content.lines().next().unwrap_or_default().trim();
            if key.is_empty() {
                warn!(path = %path.display(), "Skipping empty key file");
                continue;
            }
            debug!(path = %path.display(), "Loaded key file");
            keys.push(key.to_string());
        }

        if keys.is_empty() {
            return Err(FetchError::Config(format!(
                "No keys with prefix '{}' under {}",
                self.prefix,
                self.root.display()
            )));
        }

        info!(count = keys.len(), dir = %self.root.display(), "Got keys");
        Ok(keys)
    }
}

fn collect_key_files(dir: &Path, prefix: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_key_files(&path, prefix, out)?;
        } else if entry.file_name().to_string_lossy().starts_with(prefix) {
            out.push(path);
        }
    }
    Ok(())
}

/// Rotation state over a fixed pool of credentials.
///
/// The cursor only moves forward. Once it passes the last credential the
/// session is exhausted and [`KeySession::current`] fails for good.
#[derive(Debug)]
pub struct KeySession {
    keys: Vec<Credential>,
    cursor: AtomicUsize,
}

impl KeySession {
    /// Build a session from raw key strings
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(FetchError::Config("Credential pool is empty".to_string()));
        }
        let keys = keys
            .into_iter()
            .enumerate()
            .map(|(index, secret)| Credential { index, secret })
            .collect();
        Ok(Self {
            keys,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Load keys from a [`KeyStore`] and start at the first one
    pub fn from_store(store: &KeyStore) -> Result<Self> {
        Self::new(store.load()?)
    }

    /// Number of credentials in the pool
    pub fn pool_size(&self) -> usize {
        self.keys.len()
    }

    /// Index the cursor currently points at (may equal `pool_size` once exhausted)
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Whether every credential has been spent
    pub fn is_exhausted(&self) -> bool {
        self.cursor() >= self.keys.len()
    }

    /// The credential to use for the next call
    pub fn current(&self) -> Result<&Credential> {
        self.keys
            .get(self.cursor())
            .ok_or(FetchError::CredentialsExhausted {
                pool_size: self.keys.len(),
            })
    }

    /// Advance past credential `from` if it is still the current one.
    ///
    /// Returns `true` when this call moved the cursor. A rotation requested
    /// for a credential that is no longer current does nothing.
    pub fn rotate_from(&self, from: usize) -> bool {
        let moved = self
            .cursor
            .compare_exchange(from, from + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            if from + 1 < self.keys.len() {
                info!(from = from, to = from + 1, pool = self.keys.len(), "Rotated API key");
            } else {
                warn!(pool = self.keys.len(), "Last API key spent");
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_dir() {
        let store = KeyStore::new("/nonexistent/keys", SCOPUS_KEY_PREFIX);
        assert!(matches!(store.load(), Err(FetchError::Config(_))));
    }

    #[test]
    fn test_load_recursive_with_prefix() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("team_b"))?;
        fs::write(dir.path().join("elsevier_apikey_a"), "key-a\nignored second line\n")?;
        fs::write(dir.path().join("team_b").join("elsevier_apikey_b"), "  key-b  \n")?;
        fs::write(dir.path().join("README"), "not a key")?;
        fs::write(dir.path().join("elsevier_apikey_empty"), "\n")?;

        let keys = KeyStore::new(dir.path(), SCOPUS_KEY_PREFIX).load()?;
        assert_eq!(keys, vec!["key-a".to_string(), "key-b".to_string()]);
        Ok(())
    }

    #[test]
    fn test_load_without_matching_files() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("other_key"), "x")?;
        let store = KeyStore::new(dir.path(), SCOPUS_KEY_PREFIX);
        assert!(matches!(store.load(), Err(FetchError::Config(_))));
        Ok(())
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(KeySession::new(vec![]), Err(FetchError::Config(_))));
    }

    #[test]
    fn test_each_key_used_once_then_exhausted() -> Result<()> {
        let session = KeySession::new(vec!["a".into(), "b".into(), "c".into()])?;
        let mut used = Vec::new();
        for _ in 0..3 {
            let key = session.current()?;
            used.push(key.secret().to_string());
            session.rotate_from(key.index());
        }
        assert_eq!(used, vec!["a", "b", "c"]);
        assert!(session.is_exhausted());
        assert!(matches!(
            session.current(),
            Err(FetchError::CredentialsExhausted { pool_size: 3 })
        ));
        Ok(())
    }

    #[test]
    fn test_stale_rotation_is_noop() -> Result<()> {
        let session = KeySession::new(vec!["a".into(), "b".into(), "c".into()])?;
        assert!(session.rotate_from(0));
        assert!(!session.rotate_from(0));
        assert_eq!(session.current()?.secret(), "b");
        Ok(())
    }

    #[test]
    fn test_debug_redacts_secret() -> Result<()> {
        let session = KeySession::new(vec!["super-secret".into()])?;
        let shown = format!("{:?}", session.current()?);
        assert!(!shown.contains("super-secret"));
        Ok(())
    }
}
