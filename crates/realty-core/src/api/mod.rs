//! REST API access for the marketplace backend.
//!
//! This module provides the `SessionClient`, which sends requests to the
//! external API with the current bearer token and renews that token
//! through the refresh endpoint when the API answers 401.

pub mod client;
pub mod error;
pub mod request;
pub mod transport;

pub use client::{AuthPhase, SessionClient};
pub use error::{ApiError, AuthError, RefreshError, SendError};
pub use request::ApiRequest;
pub use reqwest::Method;
pub use transport::{ApiResponse, HttpTransport, Transport, TransportError};
