//! Session client for the realty marketplace API.
//!
//! The marketplace front-end keeps no business logic of its own; every
//! listing, dashboard and property operation is a call to the external
//! API. This crate owns the part that has to be right for all of them:
//! carrying the access token, renewing it once when the API rejects it,
//! and ending the session cleanly when it cannot be renewed.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use realty_core::{auth, Config, SessionClient, SessionContext};
//!
//! let config = Config::load()?;
//! let store = auth::open_credential_store(&config)?;
//! let client = SessionClient::from_config(&config, SessionContext::new(store))?;
//!
//! client.sign_in("buyer@example.com", "hunter2").await?;
//! let favorites: serde_json::Value = client.get_json("/favorites").await?;
//! # let _ = favorites;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, ApiRequest, ApiResponse, AuthError, AuthPhase, RefreshError, SendError, SessionClient};
pub use auth::{CredentialPair, CredentialStore, SessionContext, SessionSnapshot, SessionState, User};
pub use config::{Config, CredentialBackend, RefreshPolicy};
