//! Configuration loading and persistence.
//!
//! Settings live in `config.json` inside the config directory. Secrets
//! (gateway token and password) are never written there; they come from the
//! environment or the command line.
//!
//! Directory selection:
//! 1. `GATELINK_CONFIG_DIR` env var
//! 2. Platform config dir (`~/.config/gatelink`, `~/Library/Application Support/gatelink`)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::connection::{ManagerConfig, DEFAULT_ROLE};
use crate::protocol::{ClientInfo, ConnectAuth};
use crate::store::{FileStore, KeyringStore, Store};
use crate::transport::http_to_ws_scheme;

const CONFIG_FILE: &str = "config.json";

/// Keyring service name for the device identity.
pub const KEYRING_SERVICE: &str = "gatelink";

/// Where the device identity and device tokens are kept.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStorage {
    /// JSON files under `<config dir>/state`.
    #[default]
    File,
    /// OS keychain / Secret Service.
    Keyring,
}

/// Gateway client configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway URL (`ws://`, `wss://`, `http://` or `https://`).
    pub url: String,
    /// Client id sent in the handshake.
    pub client_id: String,
    /// Client mode sent in the handshake.
    pub client_mode: String,
    /// Display name; defaults to the host name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Request deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Default session key for `chat`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Device identity storage backend.
    pub identity_storage: IdentityStorage,
    /// Gateway token - NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
    /// Gateway password - NOT serialized to disk.
    #[serde(skip)]
    pub password: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            client_id: "gatelink-cli".to_string(),
            client_mode: "cli".to_string(),
            display_name: None,
            role: DEFAULT_ROLE.to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            request_timeout_ms: 30_000,
            session_key: None,
            identity_storage: IdentityStorage::File,
            token: None,
            password: None,
        }
    }
}

impl GatewayConfig {
    /// Returns the configuration directory, creating it if necessary.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("GATELINK_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("gatelink"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`, falling back to defaults when the file
    /// does not exist.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Apply `GATELINK_*` overrides. `lookup` returns a variable's value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("GATELINK_URL") {
            self.url = url;
        }
        if let Some(token) = lookup("GATELINK_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
        if let Some(password) = lookup("GATELINK_PASSWORD").filter(|p| !p.is_empty()) {
            self.password = Some(password);
        }
        if let Some(role) = lookup("GATELINK_ROLE") {
            self.role = role;
        }
        if let Some(timeout) = lookup("GATELINK_REQUEST_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) if ms > 0 => self.request_timeout_ms = ms,
                _ => log::warn!("[Config] Ignoring invalid GATELINK_REQUEST_TIMEOUT_MS={}", timeout),
            }
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir`. Secrets are not written.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Connection parameters for [`ConnectionManager`](crate::ConnectionManager).
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        let display_name = self.display_name.clone().or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
        });

        let client = ClientInfo {
            id: self.client_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: self.client_mode.clone(),
            display_name,
            instance_id: Some(uuid::Uuid::new_v4().to_string()),
        };

        let mut config = ManagerConfig::new(http_to_ws_scheme(&self.url), client);
        config.role.clone_from(&self.role);
        config.scopes.clone_from(&self.scopes);
        config.auth = ConnectAuth {
            token: self.token.clone(),
            password: self.password.clone(),
        };
        config.request_timeout = Duration::from_millis(self.request_timeout_ms);
        config
    }

    /// Store for the device identity and device tokens.
    #[must_use]
    pub fn identity_store(&self, dir: &Path) -> Arc<dyn Store> {
        match self.identity_storage {
            IdentityStorage::File => Arc::new(FileStore::new(dir.join("state"))),
            IdentityStorage::Keyring => Arc::new(KeyringStore::new(KEYRING_SERVICE)),
        }
    }

    /// Store for outbound queues.
    #[must_use]
    pub fn state_store(dir: &Path) -> Arc<dyn Store> {
        Arc::new(FileStore::new(dir.join("state")))
    }
}
