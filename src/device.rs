//! Device identity for gateway authentication.
//!
//! This module handles:
//! - Ed25519 signing keypair generation and persistence
//! - Signing `connect.challenge` nonces for the handshake
//! - Device tokens issued by the gateway after a device-authenticated handshake
//!
//! The device id is the lowercase hex SHA-256 of the raw 32-byte public key,
//! so the gateway can recompute it from the public key alone. Public key and
//! signatures travel as unpadded base64url.
//!
//! # Signing payload
//!
//! ```text
//! v2|{deviceId}|{clientId}|{clientMode}|{role}|{scope,scope}|{signedAtMs}|{token}|{nonce}
//! ```
//!
//! The gateway rebuilds the same string from the connect params and verifies
//! the signature against `device.publicKey`.

use std::sync::{Arc, Mutex, MutexGuard};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::GatewayError;
use crate::protocol::ChallengeResponse;
use crate::store::Store;

/// Store key of the persisted identity.
const IDENTITY_KEY: &str = "device/identity";

/// Schema version of [`StoredDevice`].
const STORED_VERSION: u8 = 1;

/// Persisted identity, including the secret key.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredDevice {
    version: u8,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKey")]
    private_key: String,
    #[serde(rename = "createdAtMs")]
    created_at_ms: i64,
}

/// Device token persisted per role.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDeviceToken {
    token: String,
    role: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(rename = "updatedAtMs")]
    updated_at_ms: i64,
}

/// Loaded device identity.
pub struct Device {
    /// Stable device id derived from the public key.
    pub id: String,
    /// Ed25519 verifying key.
    pub verifying_key: VerifyingKey,
    /// Creation time in milliseconds since the epoch.
    pub created_at_ms: i64,
    signing_key: SigningKey,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Public key as unpadded base64url.
    #[must_use]
    pub fn public_key_base64url(&self) -> String {
        BASE64URL.encode(self.verifying_key.as_bytes())
    }

    fn sign(&self, payload: &str) -> Signature {
        self.signing_key.sign(payload.as_bytes())
    }
}

/// Handshake fields bound into the device signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeClaims {
    /// `client.id` of the connect params.
    pub client_id: String,
    /// `client.mode` of the connect params.
    pub client_mode: String,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// `auth.token`, if any.
    pub token: Option<String>,
}

/// Build the canonical string a device signs for a challenge.
#[must_use]
pub fn signing_payload(
    device_id: &str,
    claims: &HandshakeClaims,
    signed_at_ms: i64,
    nonce: &str,
) -> String {
    let scopes = claims.scopes.join(",");
    let signed_at = signed_at_ms.to_string();
    [
        "v2",
        device_id,
        claims.client_id.as_str(),
        claims.client_mode.as_str(),
        claims.role.as_str(),
        scopes.as_str(),
        signed_at.as_str(),
        claims.token.as_deref().unwrap_or_default(),
        nonce,
    ]
    .join("|")
}

/// Derive the device id from raw public key bytes.
#[must_use]
pub fn derive_device_id(public_key: &[u8]) -> String {
    Sha256::digest(public_key)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Check a challenge response the way the gateway does: the id must match the
/// public key and the signature must cover the canonical payload.
#[must_use]
pub fn verify_challenge_response(response: &ChallengeResponse, claims: &HandshakeClaims) -> bool {
    let Ok(key_bytes) = BASE64URL.decode(&response.public_key) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64URL.decode(&response.signature) else {
        return false;
    };
    if derive_device_id(&key_bytes) != response.id {
        return false;
    }
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    let payload = signing_payload(&response.id, claims, response.signed_at, &response.nonce);
    verifying_key
        .verify_strict(payload.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Manages the per-installation signing identity.
///
/// The identity is created on first use, persisted through the [`Store`], and
/// cached for the lifetime of this value. One instance is expected per
/// installation; load/create is serialized by an internal lock so concurrent
/// callers never generate two keypairs.
pub struct DeviceIdentity {
    store: Arc<dyn Store>,
    cached: Mutex<Option<Arc<Device>>>,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Create an identity manager backed by `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, Option<Arc<Device>>>, GatewayError> {
        self.cached
            .lock()
            .map_err(|_poisoned| GatewayError::DeviceIdentityUnavailable("identity lock poisoned".into()))
    }

    /// Return the cached identity, loading or creating it on first use.
    pub fn get_or_create(&self) -> Result<Arc<Device>, GatewayError> {
        // Hold the lock for the entire load/create to prevent races.
        let mut cached = self.lock_cache()?;
        if let Some(device) = cached.as_ref() {
            return Ok(Arc::clone(device));
        }

        let stored = self
            .store
            .load(IDENTITY_KEY)
            .map_err(|e| GatewayError::DeviceIdentityUnavailable(e.to_string()))?;

        let device = match stored {
            Some(content) => Self::load_from(&content)?,
            None => self.create_new()?,
        };

        let device = Arc::new(device);
        *cached = Some(Arc::clone(&device));
        Ok(device)
    }

    fn load_from(content: &str) -> Result<Device, GatewayError> {
        let stored: StoredDevice = serde_json::from_str(content).map_err(|e| {
            GatewayError::DeviceIdentityUnavailable(format!("failed to parse stored identity: {e}"))
        })?;

        if stored.version != STORED_VERSION {
            return Err(GatewayError::DeviceIdentityUnavailable(format!(
                "unsupported identity version {}",
                stored.version
            )));
        }

        let secret = Zeroizing::new(BASE64URL.decode(&stored.private_key).map_err(|e| {
            GatewayError::DeviceIdentityUnavailable(format!("invalid private key encoding: {e}"))
        })?);
        let key_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
            secret
                .as_slice()
                .try_into()
                .map_err(|_len| GatewayError::DeviceIdentityUnavailable("invalid private key length".into()))?,
        );

        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        let derived_id = derive_device_id(verifying_key.as_bytes());

        if derived_id != stored.device_id || BASE64URL.encode(verifying_key.as_bytes()) != stored.public_key {
            log::error!(
                "[Device] Stored key derives to {}, expected {}. The stored key does not belong to this identity.",
                derived_id,
                stored.device_id
            );
            return Err(GatewayError::DeviceIdentityUnavailable(format!(
                "stored identity mismatch: expected {}, key derives to {}; clear the device identity to recreate it",
                stored.device_id, derived_id
            )));
        }

        log::info!("[Device] Loaded device identity: id={}", derived_id);

        Ok(Device {
            id: derived_id,
            verifying_key,
            created_at_ms: stored.created_at_ms,
            signing_key,
        })
    }

    fn create_new(&self) -> Result<Device, GatewayError> {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut *secret);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        let id = derive_device_id(verifying_key.as_bytes());
        let created_at_ms = chrono::Utc::now().timestamp_millis();

        let stored = StoredDevice {
            version: STORED_VERSION,
            device_id: id.clone(),
            public_key: BASE64URL.encode(verifying_key.as_bytes()),
            private_key: BASE64URL.encode(&*secret),
            created_at_ms,
        };
        let content = Zeroizing::new(serde_json::to_string(&stored).map_err(|e| {
            GatewayError::DeviceIdentityUnavailable(format!("failed to serialize identity: {e}"))
        })?);

        self.store
            .save(IDENTITY_KEY, &content)
            .map_err(|e| GatewayError::DeviceIdentityUnavailable(e.to_string()))?;

        log::info!("[Device] Created new device identity: id={}", id);

        Ok(Device {
            id,
            verifying_key,
            created_at_ms,
            signing_key,
        })
    }

    /// Sign a challenge nonce for the handshake.
    ///
    /// Fails with [`GatewayError::DeviceIdentityUnavailable`] when the identity
    /// cannot be loaded or created; never returns an unsigned assertion.
    pub fn sign_challenge(
        &self,
        nonce: &str,
        claims: &HandshakeClaims,
    ) -> Result<ChallengeResponse, GatewayError> {
        let device = self.get_or_create()?;
        let signed_at = chrono::Utc::now().timestamp_millis();
        let payload = signing_payload(&device.id, claims, signed_at, nonce);
        let signature = device.sign(&payload);

        Ok(ChallengeResponse {
            id: device.id.clone(),
            public_key: device.public_key_base64url(),
            signature: BASE64URL.encode(signature.to_bytes()),
            signed_at,
            nonce: nonce.to_string(),
        })
    }

    /// Drop the cached identity and delete the persisted one. The next
    /// [`Self::get_or_create`] generates a fresh keypair.
    pub fn clear(&self) -> Result<(), GatewayError> {
        let mut cached = self.lock_cache()?;
        *cached = None;
        self.store
            .remove(IDENTITY_KEY)
            .map_err(|e| GatewayError::DeviceIdentityUnavailable(e.to_string()))?;
        log::info!("[Device] Cleared device identity");
        Ok(())
    }

    fn token_key(device_id: &str, role: &str) -> String {
        format!("device/tokens/{device_id}/{role}")
    }

    /// Device token previously issued for `role`, if any.
    ///
    /// Errors are logged and treated as "no token": a missing token only means
    /// the handshake falls back to the configured credentials.
    #[must_use]
    pub fn device_token(&self, role: &str) -> Option<String> {
        let device = self.get_or_create().ok()?;
        match self.store.load(&Self::token_key(&device.id, role)) {
            Ok(Some(content)) => serde_json::from_str::<StoredDeviceToken>(&content)
                .map(|stored| stored.token)
                .map_err(|e| log::warn!("[Device] Ignoring unreadable device token: {}", e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                log::warn!("[Device] Failed to read device token: {}", e);
                None
            }
        }
    }

    /// Persist a device token issued by the gateway.
    pub fn store_device_token(
        &self,
        role: &str,
        token: &str,
        scopes: &[String],
    ) -> Result<(), GatewayError> {
        let device = self.get_or_create()?;
        let stored = StoredDeviceToken {
            token: token.to_string(),
            role: role.to_string(),
            scopes: scopes.to_vec(),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let content = serde_json::to_string(&stored)
            .map_err(|e| GatewayError::Protocol(format!("failed to serialize device token: {e}")))?;
        self.store.save(&Self::token_key(&device.id, role), &content)?;
        log::debug!("[Device] Stored device token for role {}", role);
        Ok(())
    }

    /// Forget the device token for `role`.
    pub fn clear_device_token(&self, role: &str) -> Result<(), GatewayError> {
        let device = self.get_or_create()?;
        self.store.remove(&Self::token_key(&device.id, role))?;
        log::info!("[Device] Cleared device token for role {}", role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};

    fn claims() -> HandshakeClaims {
        HandshakeClaims {
            client_id: "gatelink-cli".into(),
            client_mode: "cli".into(),
            role: "operator".into(),
            scopes: vec!["operator.read".into(), "operator.write".into()],
            token: Some("secret".into()),
        }
    }

    /// Store that refuses every operation, like a locked keychain.
    #[derive(Debug)]
    struct LockedStore;

    impl Store for LockedStore {
        fn load(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("keyring locked".into()))
        }
        fn save(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("keyring locked".into()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("keyring locked".into()))
        }
    }

    #[test]
    fn test_device_id_is_hex_sha256() {
        let id = derive_device_id(&[7u8; 32]);
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_signing_payload_layout() {
        let payload = signing_payload("dev", &claims(), 1700, "abc");
        assert_eq!(
            payload,
            "v2|dev|gatelink-cli|cli|operator|operator.read,operator.write|1700|secret|abc"
        );

        let no_token = HandshakeClaims {
            token: None,
            ..claims()
        };
        assert!(signing_payload("dev", &no_token, 1, "n").ends_with("|1||n"));
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let identity = DeviceIdentity::new(Arc::new(MemoryStore::new()));
        let first = identity.get_or_create().unwrap();
        let second = identity.get_or_create().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_identity_survives_new_instance() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = DeviceIdentity::new(Arc::clone(&store)).get_or_create().unwrap();
        let second = DeviceIdentity::new(store).get_or_create().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.public_key_base64url(), second.public_key_base64url());
        assert_eq!(first.created_at_ms, second.created_at_ms);
    }

    #[test]
    fn test_sign_challenge_distinct_nonces() {
        let identity = DeviceIdentity::new(Arc::new(MemoryStore::new()));
        let a = identity.sign_challenge("n1", &claims()).unwrap();
        let b = identity.sign_challenge("n2", &claims()).unwrap();

        assert_eq!(a.id, b.id);
        assert_ne!(a.signature, b.signature);
        assert_eq!(a.nonce, "n1");
        assert!(verify_challenge_response(&a, &claims()));
        assert!(verify_challenge_response(&b, &claims()));
    }

    #[test]
    fn test_tampered_response_fails_verification() {
        let identity = DeviceIdentity::new(Arc::new(MemoryStore::new()));
        let response = identity.sign_challenge("abc", &claims()).unwrap();

        let mut wrong_nonce = response.clone();
        wrong_nonce.nonce = "abd".into();
        assert!(!verify_challenge_response(&wrong_nonce, &claims()));

        let other_role = HandshakeClaims {
            role: "node".into(),
            ..claims()
        };
        assert!(!verify_challenge_response(&response, &other_role));

        let mut wrong_id = response;
        wrong_id.id = "00".repeat(32);
        assert!(!verify_challenge_response(&wrong_id, &claims()));
    }

    #[test]
    fn test_clear_generates_new_identity() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let identity = DeviceIdentity::new(Arc::clone(&store));
        let before = identity.get_or_create().unwrap().id.clone();

        identity.clear().unwrap();
        assert_eq!(store.load(IDENTITY_KEY).unwrap(), None);

        let after = identity.get_or_create().unwrap().id.clone();
        assert_ne!(before, after);
    }

    #[test]
    fn test_unavailable_store_fails_explicitly() {
        let identity = DeviceIdentity::new(Arc::new(LockedStore));
        let result = identity.sign_challenge("n", &claims());
        assert!(matches!(result, Err(GatewayError::DeviceIdentityUnavailable(_))));
    }

    #[test]
    fn test_corrupted_identity_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.save(IDENTITY_KEY, "{not json").unwrap();
        let identity = DeviceIdentity::new(store);
        assert!(matches!(
            identity.get_or_create(),
            Err(GatewayError::DeviceIdentityUnavailable(_))
        ));
    }

    #[test]
    fn test_mismatched_identity_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        DeviceIdentity::new(Arc::clone(&store)).get_or_create().unwrap();

        let mut value: serde_json::Value =
            serde_json::from_str(&store.load(IDENTITY_KEY).unwrap().unwrap()).unwrap();
        value["deviceId"] = serde_json::json!("ff".repeat(32));
        store.save(IDENTITY_KEY, &value.to_string()).unwrap();

        let result = DeviceIdentity::new(store).get_or_create();
        assert!(matches!(result, Err(GatewayError::DeviceIdentityUnavailable(_))));
    }

    #[test]
    fn test_device_token_roundtrip() {
        let identity = DeviceIdentity::new(Arc::new(MemoryStore::new()));
        assert_eq!(identity.device_token("operator"), None);

        identity
            .store_device_token("operator", "dt-1", &["operator.admin".into()])
            .unwrap();
        assert_eq!(identity.device_token("operator").as_deref(), Some("dt-1"));
        assert_eq!(identity.device_token("node"), None);

        identity.clear_device_token("operator").unwrap();
        assert_eq!(identity.device_token("operator"), None);
    }
}
