//! Authentication module for managing sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: Where the access/refresh token pair lives (memory,
//!   JSON file, or OS keychain)
//! - `SessionState`: Observable session state read by the UI layer
//! - The remote auth endpoints (sign-in, refresh, verification, reset)

pub mod credentials;
pub mod models;
pub(crate) mod remote;
pub mod session;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{Config, CredentialBackend};

pub use credentials::{
    CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, StoreError,
};
pub use models::{User, VerifyEmailResponse};
pub use session::{SessionContext, SessionSnapshot, SessionState};

/// Keychain account holding the session pair
const KEYRING_ACCOUNT: &str = "session";

/// Open the credential store selected by `config`.
pub fn open_credential_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.credential_backend {
        CredentialBackend::File => Arc::new(FileCredentialStore::open(config.credentials_dir()?)?),
        CredentialBackend::Keyring => Arc::new(KeyringCredentialStore::open(KEYRING_ACCOUNT)?),
        CredentialBackend::Memory => Arc::new(MemoryCredentialStore::new()),
    };
    Ok(store)
}
