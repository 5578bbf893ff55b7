//! Durable key/value storage for local client state.
//!
//! The client persists three kinds of state: the device signing identity,
//! device tokens issued by the gateway, and one outbound-queue snapshot per
//! session. All of it goes through the [`Store`] trait so the backing medium
//! can be chosen per deployment:
//!
//! - [`FileStore`]: one file per key under a directory (0600 on unix)
//! - [`KeyringStore`]: one OS keyring entry per key (macOS keychain, Secret Service)
//! - [`MemoryStore`]: in-process map for tests and ephemeral clients
//!
//! Keys are short slash-separated paths such as `device/identity` or
//! `queue/agent:main:main`.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use keyring::Entry;

/// Number of retry attempts for keyring access.
const KEYRING_RETRY_ATTEMPTS: u32 = 2;
/// Delay between retry attempts in milliseconds.
const KEYRING_RETRY_DELAY_MS: u64 = 500;

/// Categorized storage failures.
#[derive(Debug)]
pub enum StoreError {
    /// The backing store cannot be reached (keyring locked, access denied).
    Unavailable(String),
    /// Data exists but cannot be parsed.
    Corrupted(String),
    /// Filesystem error.
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::Corrupted(msg) => write!(f, "stored data corrupted: {msg}"),
            Self::Io(err) => write!(f, "store I/O error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Durable string storage keyed by path-like names.
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Read a value. Missing keys are `Ok(None)`.
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one.
    fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value. Deleting a missing key succeeds.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// ── File store ───────────────────────────────────────────────────────────────

/// Stores each key as a JSON file below a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a file path. Each `/`-separated segment becomes a
    /// directory level; characters outside `[A-Za-z0-9._-]` are escaped so
    /// session keys like `agent:main:main` stay portable.
    fn path_for(&self, key: &str) -> PathBuf {
        let segments: Vec<String> = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(sanitize_segment)
            .collect();

        let mut path = self.root.clone();
        if let Some((last, dirs)) = segments.split_last() {
            for dir in dirs {
                path.push(dir);
            }
            path.push(format!("{last}.json"));
        } else {
            path.push("_.json");
        }
        path
    }
}

fn sanitize_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for ch in segment.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
            out.push(ch);
        } else if ch == '.' && !out.is_empty() {
            out.push(ch);
        } else {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    out
}

impl Store for FileStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a truncated file behind.
        // The temp file is created owner-only; a leftover one from a crash
        // may carry wider bits, so it is never reused.
        let tmp = path.with_extension("json.tmp");
        match fs::remove_file(&tmp) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(StoreError::Io(e)),
            _ => {}
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        log::trace!("[Store] Saved {}", path.display());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

// ── Keyring store ────────────────────────────────────────────────────────────

/// Stores each key as a separate OS keyring entry under one service name.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Create a keyring-backed store for `service`.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create entry: {e:?}")))
    }

    fn try_load(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(categorize_keyring_error(&e)),
        }
    }
}

/// Categorize a keyring error for better user feedback.
fn categorize_keyring_error(err: &keyring::Error) -> StoreError {
    let msg = format!("{err:?}");
    let msg_lower = msg.to_lowercase();

    if msg_lower.contains("user interaction") || msg_lower.contains("user canceled") {
        return StoreError::Unavailable(format!("keyring locked: {msg}"));
    }

    if msg_lower.contains("denied")
        || msg_lower.contains("codesign")
        || msg_lower.contains("authorization")
        || msg_lower.contains("not allowed")
    {
        return StoreError::Unavailable(format!("keyring access denied: {msg}"));
    }

    if matches!(err, keyring::Error::BadEncoding(_)) {
        return StoreError::Corrupted(msg);
    }

    StoreError::Unavailable(msg)
}

impl Store for KeyringStore {
    /// Retries once on transient failures (locked keychain right after a
    /// rebuild is the common case on macOS).
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut last_error = None;

        for attempt in 0..KEYRING_RETRY_ATTEMPTS {
            if attempt > 0 {
                log::debug!(
                    "[Store] Retrying keyring access (attempt {}/{})",
                    attempt + 1,
                    KEYRING_RETRY_ATTEMPTS
                );
                thread::sleep(Duration::from_millis(KEYRING_RETRY_DELAY_MS));
            }

            match self.try_load(key) {
                Ok(value) => return Ok(value),
                Err(StoreError::Corrupted(msg)) => return Err(StoreError::Corrupted(msg)),
                Err(err) => {
                    log::debug!("[Store] Keyring access attempt {} failed: {}", attempt + 1, err);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Unavailable("keyring unreachable".into())))
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| categorize_keyring_error(&e))?;
        log::debug!("[Store] Saved keyring entry {}/{}", self.service, key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(categorize_keyring_error(&e)),
        }
    }
}

// ── Memory store ─────────────────────────────────────────────────────────────

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_poisoned| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
