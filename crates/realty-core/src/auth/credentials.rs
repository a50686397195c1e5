//! Credential pair storage.
//!
//! Every store keeps the pair behind a single lock and swaps it as a unit,
//! so a reader sees either the old pair or the new one, never a mix.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Credentials file name in the credentials directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Keychain service name
const SERVICE_NAME: &str = "realty-session";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write credentials: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode credentials: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

pub trait CredentialStore: Send + Sync {
    /// Current pair. Served from memory; never fails.
    fn get(&self) -> Option<CredentialPair>;

    /// Replace both tokens. On error the previous pair is kept.
    fn replace(&self, pair: CredentialPair) -> Result<(), StoreError>;

    /// Remove both tokens. The in-memory pair is gone even if persisting fails.
    fn clear(&self) -> Result<(), StoreError>;

    fn access_token(&self) -> Option<String> {
        self.get().map(|pair| pair.access_token)
    }

    fn refresh_token(&self) -> Option<String> {
        self.get().map(|pair| pair.refresh_token)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    current: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            current: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.current.read().clone()
    }

    fn replace(&self, pair: CredentialPair) -> Result<(), StoreError> {
        *self.current.write() = Some(pair);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.current.write() = None;
        Ok(())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(flatten)]
    pair: CredentialPair,
    stored_at: DateTime<Utc>,
}

#[derive(Debug)]
struct FileState {
    pair: Option<CredentialPair>,
    stored_at: Option<DateTime<Utc>>,
}

/// JSON file store. Writes go to a temp file that is renamed over the
/// credentials file.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    state: RwLock<FileState>,
}

impl FileCredentialStore {
    /// Open the store in `dir`, loading any pair already on disk.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CREDENTIALS_FILE);
        let mut state = FileState {
            pair: None,
            stored_at: None,
        };

        if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read credentials file")?;
            match serde_json::from_str::<StoredCredentials>(&contents) {
                Ok(stored) => {
                    debug!(stored_at = %stored.stored_at, "Loaded stored credentials");
                    state.pair = Some(stored.pair);
                    state.stored_at = Some(stored.stored_at);
                }
                Err(e) => {
                    // A corrupt file means no usable session; the next write replaces it.
                    warn!(error = %e, "Ignoring unreadable credentials file");
                }
            }
        }

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the current pair was written.
    pub fn stored_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().stored_at
    }

    fn persist(&self, stored: &StoredCredentials) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(stored)?;

        // A leftover temp file would keep its old mode
        match std::fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut file = private_file_options().open(&tmp)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Options for a new file only the owner can read.
fn private_file_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.state.read().pair.clone()
    }

    fn replace(&self, pair: CredentialPair) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let stored = StoredCredentials {
            pair,
            stored_at: Utc::now(),
        };
        self.persist(&stored)?;
        state.stored_at = Some(stored.stored_at);
        state.pair = Some(stored.pair);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.pair = None;
        state.stored_at = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// OS keychain store
// ============================================================================

/// Keychain store. The pair is serialized as one secret.
pub struct KeyringCredentialStore {
    entry: Entry,
    current: RwLock<Option<CredentialPair>>,
}

impl KeyringCredentialStore {
    /// Open the keychain entry for `account`, loading any stored pair.
    pub fn open(account: &str) -> Result<Self> {
        let entry =
            Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")?;

        let current = match entry.get_password() {
            Ok(secret) => match serde_json::from_str::<CredentialPair>(&secret) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable keychain credentials");
                    None
                }
            },
            Err(keyring::Error::NoEntry) => None,
            Err(e) => return Err(e).context("Failed to read credentials from keychain"),
        };

        Ok(Self {
            entry,
            current: RwLock::new(current),
        })
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.current.read().clone()
    }

    fn replace(&self, pair: CredentialPair) -> Result<(), StoreError> {
        let mut current = self.current.write();
        self.entry.set_password(&serde_json::to_string(&pair)?)?;
        *current = Some(pair);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut current = self.current.write();
        *current = None;
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
