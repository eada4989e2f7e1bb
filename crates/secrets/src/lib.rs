//! Secret store — opaque-reference encryption of adapter credentials.
//!
//! Sensitive config values (API keys, passwords, session tokens) are held
//! encrypted at rest and replaced in config bags by opaque references of
//! the form `$secret:<hex>`. Plaintext is materialised only when a child
//! process is launched; listing surfaces render `[encrypted]` instead.
//!
//! Encryption is AES-256-GCM with a fresh random 96-bit nonce per entry.
//! The key lives next to the database and is generated with owner-only
//! permissions on first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Prefix marking a config value as a secret reference.
pub const REFERENCE_PREFIX: &str = "$secret:";

/// What listing tools show in place of a reference. Non-reversible.
pub const REDACTED_PLACEHOLDER: &str = "[encrypted]";

const KEY_FILE: &str = "secrets.key";
const DB_FILE: &str = "secrets.json";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const REFERENCE_ID_LEN: usize = 16;

/// A config bag, as stored on adapter records.
pub type ConfigBag = std::collections::BTreeMap<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown secret reference: {0}")]
    UnknownReference(String),

    #[error("secret cipher failure: {0}")]
    Cipher(String),

    #[error("secret key file is malformed: {0}")]
    MalformedKey(PathBuf),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// One encrypted entry as persisted. The GCM tag is appended to the
/// ciphertext, so no separate column is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretRecord {
    id: String,
    ciphertext: String,
    nonce: String,
    created_at: DateTime<Utc>,
}

/// File-backed secret store. All writes happen under one lock and replace
/// the database atomically (write + rename).
pub struct SecretStore {
    cipher: Aes256Gcm,
    db_path: PathBuf,
    records: Mutex<HashMap<String, SecretRecord>>,
}

impl SecretStore {
    /// Open (or initialise) the store under the given state directory.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let key = load_or_create_key(&state_dir.join(KEY_FILE))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let db_path = state_dir.join(DB_FILE);
        let records = match std::fs::read_to_string(&db_path) {
            Ok(data) => {
                let list: Vec<SecretRecord> = serde_json::from_str(&data)?;
                let count = list.len();
                let map = list.into_iter().map(|r| (r.id.clone(), r)).collect();
                tracing::debug!(count, "loaded secret records");
                map
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            cipher,
            db_path,
            records: Mutex::new(records),
        })
    }

    /// Whether a string value is a secret reference.
    pub fn is_reference(value: &str) -> bool {
        value.starts_with(REFERENCE_PREFIX)
    }

    /// Encrypt a plaintext and return its opaque reference.
    pub fn store(&self, plaintext: &str) -> Result<String> {
        let mut id_bytes = [0u8; REFERENCE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let id = hex::encode(id_bytes);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::Cipher(e.to_string()))?;

        let record = SecretRecord {
            id: id.clone(),
            ciphertext: hex::encode(ciphertext),
            nonce: hex::encode(nonce_bytes),
            created_at: Utc::now(),
        };

        {
            let mut records = self.records.lock();
            records.insert(id.clone(), record);
            self.persist_locked(&records)?;
        }

        Ok(format!("{REFERENCE_PREFIX}{id}"))
    }

    /// Decrypt the plaintext behind a reference.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let id = reference
            .strip_prefix(REFERENCE_PREFIX)
            .ok_or_else(|| SecretError::UnknownReference(reference.to_string()))?;

        let record = self
            .records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SecretError::UnknownReference(reference.to_string()))?;

        let nonce_bytes = hex::decode(&record.nonce)
            .map_err(|e| SecretError::Cipher(format!("bad nonce encoding: {e}")))?;
        let ciphertext = hex::decode(&record.ciphertext)
            .map_err(|e| SecretError::Cipher(format!("bad ciphertext encoding: {e}")))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| SecretError::Cipher(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| SecretError::Cipher(format!("plaintext is not UTF-8: {e}")))
    }

    /// Shallow-walk a config bag, substituting each reference string with
    /// its plaintext. Non-strings and non-reference strings pass through.
    pub fn resolve_bag(&self, bag: &ConfigBag) -> Result<ConfigBag> {
        let mut resolved = ConfigBag::new();
        for (key, value) in bag {
            let out = match value.as_str() {
                Some(s) if Self::is_reference(s) => {
                    serde_json::Value::String(self.resolve(s)?)
                }
                _ => value.clone(),
            };
            resolved.insert(key.clone(), out);
        }
        Ok(resolved)
    }

    /// Erase every reference found in a bag. Idempotent: unknown
    /// references are skipped silently.
    pub fn delete_for_bag(&self, bag: &ConfigBag) -> Result<()> {
        let mut records = self.records.lock();
        let mut erased = 0usize;
        for value in bag.values() {
            if let Some(id) = value
                .as_str()
                .and_then(|s| s.strip_prefix(REFERENCE_PREFIX))
            {
                if records.remove(id).is_some() {
                    erased += 1;
                }
            }
        }
        if erased > 0 {
            self.persist_locked(&records)?;
            tracing::debug!(erased, "erased secrets for deleted adapter");
        }
        Ok(())
    }

    /// Replace every reference in a bag with a non-reversible placeholder.
    /// Used by listing surfaces shown to the reasoning layer.
    pub fn redact_bag(bag: &ConfigBag) -> ConfigBag {
        bag.iter()
            .map(|(key, value)| {
                let out = match value.as_str() {
                    Some(s) if Self::is_reference(s) => {
                        serde_json::Value::String(REDACTED_PLACEHOLDER.to_string())
                    }
                    _ => value.clone(),
                };
                (key.clone(), out)
            })
            .collect()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn persist_locked(&self, records: &HashMap<String, SecretRecord>) -> Result<()> {
        let mut list: Vec<&SecretRecord> = records.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_string_pretty(&list)?;

        let tmp = self.db_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.db_path)?;
        Ok(())
    }
}

/// Read the key file, or generate a fresh 256-bit key with owner-only
/// permissions when absent.
fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    match std::fs::read_to_string(path) {
        Ok(data) => {
            let bytes = hex::decode(data.trim())
                .map_err(|_| SecretError::MalformedKey(path.to_path_buf()))?;
            bytes
                .try_into()
                .map_err(|_| SecretError::MalformedKey(path.to_path_buf()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            std::fs::write(path, hex::encode(key))?;
            restrict_permissions(path)?;
            tracing::info!(path = %path.display(), "generated secret store key");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
