//! Session-aware API client.
//!
//! `SessionClient` attaches the stored access token to outbound requests,
//! recovers from a rejected token with one refresh-and-retry per request,
//! and ends the session when the refresh cannot succeed.
//!
//! Refreshes are single-flight: the first request to see a 401 starts the
//! refresh and parks it in the client's phase as a shared future; every
//! other request that sees a 401 meanwhile awaits that same future.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::auth::remote::request_refresh;
use crate::auth::{CredentialPair, CredentialStore, SessionContext, SessionState, StoreError, User};
use crate::config::{Config, RefreshPolicy};

use super::error::{truncate_body, ApiError, AuthError, RefreshError, SendError};
use super::request::ApiRequest;
use super::transport::{ApiResponse, HttpTransport, Transport, TransportError};

type RefreshFlight = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

/// Where the client is in the token lifecycle.
///
/// `Refreshing` lasts until a caller awaiting the refresh sees it finish.
/// If every such caller is dropped first, the refresh stays pending and
/// the next caller that needs a credential resumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Anonymous,
    Authenticated,
    Refreshing,
}

enum Phase {
    Anonymous,
    Authenticated,
    Refreshing(RefreshFlight),
}

enum Recovery {
    /// The stored token already differs from the rejected one.
    Current(String),
    /// Await `flight`, joined while the session was at `generation`.
    Flight(RefreshFlight, u64),
}

/// A failed recovery and the session generation it was attempted under.
struct RecoveryError {
    generation: u64,
    error: RefreshError,
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    session: SessionState,
    policy: RefreshPolicy,
    phase: Mutex<Phase>,
    /// Bumped on sign-in and logout. A refresh started under an older
    /// generation does not write its result. Lock order: `phase`, then this.
    generation: Arc<Mutex<u64>>,
}

/// Clone is cheap - all clones share one session and one refresh flight.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
}

impl SessionClient {
    pub fn new(transport: Arc<dyn Transport>, context: SessionContext) -> Self {
        Self::with_policy(transport, context, RefreshPolicy::default())
    }

    /// Build a client over `context`. A stored pair restores the session.
    pub fn with_policy(
        transport: Arc<dyn Transport>,
        context: SessionContext,
        policy: RefreshPolicy,
    ) -> Self {
        let SessionContext { store, session } = context;
        let phase = match store.get() {
            Some(pair) => {
                debug!("Restoring session from stored credentials");
                session.set_access_token(pair.access_token);
                Phase::Authenticated
            }
            None => {
                session.clear();
                Phase::Anonymous
            }
        };

        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                session,
                policy,
                phase: Mutex::new(phase),
                generation: Arc::new(Mutex::new(0)),
            }),
        }
    }

    /// Client over HTTP using the configured base URL, timeout and refresh policy.
    pub fn from_config(config: &Config, context: SessionContext) -> Result<Self, TransportError> {
        let transport = HttpTransport::new(config.api_base_url.clone(), config.request_timeout())?;
        Ok(Self::with_policy(
            Arc::new(transport),
            context,
            config.refresh.clone(),
        ))
    }

    pub fn session(&self) -> &SessionState {
        &self.inner.session
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    pub fn phase(&self) -> AuthPhase {
        match &*self.inner.phase.lock() {
            Phase::Anonymous => AuthPhase::Anonymous,
            Phase::Authenticated => AuthPhase::Authenticated,
            Phase::Refreshing(_) => AuthPhase::Refreshing,
        }
    }

    /// Set the stored access token as the request's bearer credential.
    /// Without a stored token the request is returned untouched.
    pub fn attach_credential(&self, mut request: ApiRequest) -> ApiRequest {
        if let Some(token) = self.inner.store.access_token() {
            if let Err(e) = request.set_bearer(&token) {
                warn!(error = %e, "Stored access token is not a valid header value");
            }
        }
        request
    }

    /// Send an already-attached request.
    ///
    /// Any status other than 401 is returned as a response. A 401 on a
    /// request that has not been retried triggers one credential recovery
    /// and one resend; a 401 on a retried request is terminal.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, SendError> {
        loop {
            let response = self.inner.transport.execute(&request).await?;
            if !response.is_unauthorized() {
                return Ok(response);
            }

            if request.is_retried() {
                debug!(method = %request.method, path = %request.path, "Retried request rejected again");
                return Err(AuthError::RetryRejected {
                    body: truncate_body(&response.text()),
                }
                .into());
            }
            request.mark_retried();
            debug!(method = %request.method, path = %request.path, "Access token rejected");

            let sent_with = request.bearer_token().map(str::to_owned);
            let token = match self.recover_credential(sent_with.as_deref()).await {
                Ok(token) => token,
                Err(RecoveryError { generation, error }) => {
                    if error != RefreshError::Superseded && self.logout_if_current(generation) {
                        warn!(error = %error, path = %request.path, "Credential refresh failed, ending session");
                        return Err(AuthError::RefreshFailed(error).into());
                    }
                    // The session changed while this request waited; a new
                    // sign-in is used, otherwise it is already over.
                    match self.inner.store.access_token() {
                        Some(token) => token,
                        None => return Err(AuthError::RefreshFailed(error).into()),
                    }
                }
            };

            if let Err(e) = request.set_bearer(&token) {
                self.force_logout();
                return Err(
                    AuthError::RefreshFailed(RefreshError::InvalidResponse(e.to_string())).into(),
                );
            }
        }
    }

    /// Obtain a new access token, sharing any refresh already in flight.
    ///
    /// Does not end the session on failure; the stored pair is left as is.
    pub async fn ensure_fresh_credential(&self) -> Result<String, RefreshError> {
        match self.join_or_start_refresh(|_| false).map_err(|e| e.error)? {
            Recovery::Current(token) => Ok(token),
            Recovery::Flight(flight, _) => self.await_flight(flight).await,
        }
    }

    /// Like `ensure_fresh_credential`, but a token that was already replaced
    /// since `sent_with` went out is reused instead of refreshed again.
    async fn recover_credential(&self, sent_with: Option<&str>) -> Result<String, RecoveryError> {
        let recovery =
            self.join_or_start_refresh(|pair| sent_with != Some(pair.access_token.as_str()))?;
        match recovery {
            Recovery::Current(token) => Ok(token),
            Recovery::Flight(flight, generation) => self
                .await_flight(flight)
                .await
                .map_err(|error| RecoveryError { generation, error }),
        }
    }

    fn join_or_start_refresh(
        &self,
        superseded: impl FnOnce(&CredentialPair) -> bool,
    ) -> Result<Recovery, RecoveryError> {
        let mut phase = self.inner.phase.lock();
        let generation = *self.inner.generation.lock();
        if let Phase::Refreshing(flight) = &*phase {
            debug!("Joining in-flight credential refresh");
            return Ok(Recovery::Flight(flight.clone(), generation));
        }

        let pair = self
            .inner
            .store
            .get()
            .filter(|pair| !pair.refresh_token.is_empty())
            .ok_or(RecoveryError {
                generation,
                error: RefreshError::NoRefreshToken,
            })?;
        if superseded(&pair) {
            debug!("Access token replaced since the request was sent");
            return Ok(Recovery::Current(pair.access_token));
        }

        let task = RefreshTask {
            transport: Arc::clone(&self.inner.transport),
            store: Arc::clone(&self.inner.store),
            session: self.inner.session.clone(),
            policy: self.inner.policy.clone(),
            generation: Arc::clone(&self.inner.generation),
            started_in: generation,
            refresh_token: pair.refresh_token,
        };
        let flight = task.run().boxed().shared();
        *phase = Phase::Refreshing(flight.clone());
        Ok(Recovery::Flight(flight, generation))
    }

    async fn await_flight(&self, flight: RefreshFlight) -> Result<String, RefreshError> {
        let result = flight.clone().await;

        let mut phase = self.inner.phase.lock();
        if let Phase::Refreshing(current) = &*phase {
            if current.ptr_eq(&flight) {
                *phase = if self.inner.store.get().is_some() {
                    Phase::Authenticated
                } else {
                    Phase::Anonymous
                };
            }
        }
        result
    }

    /// Clear both stored tokens and the session state.
    pub fn force_logout(&self) {
        let mut phase = self.inner.phase.lock();
        let mut generation = self.inner.generation.lock();
        self.end_session(&mut phase, &mut generation);
    }

    /// Log out only if the session is still the one at `generation`.
    fn logout_if_current(&self, generation: u64) -> bool {
        let mut phase = self.inner.phase.lock();
        let mut current = self.inner.generation.lock();
        if *current != generation {
            debug!("Session changed since the refresh started; not logging out");
            return false;
        }
        self.end_session(&mut phase, &mut current);
        true
    }

    fn end_session(&self, phase: &mut Phase, generation: &mut u64) {
        *generation += 1;

        let had_credentials = self.inner.store.get().is_some();
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to remove persisted credentials");
        }
        self.inner.session.clear();
        *phase = Phase::Anonymous;

        if had_credentials {
            info!("Session ended");
        } else {
            debug!("Logout with no stored credentials");
        }
    }

    /// Store a freshly issued pair and mark the session authenticated.
    pub(crate) fn install_credentials(
        &self,
        pair: CredentialPair,
        user: Option<User>,
    ) -> Result<(), StoreError> {
        let mut phase = self.inner.phase.lock();
        let mut generation = self.inner.generation.lock();
        self.inner.store.replace(pair.clone())?;
        *generation += 1;
        self.inner.session.establish(pair.access_token, user);
        *phase = Phase::Authenticated;
        Ok(())
    }

    /// Record the signed-in user, unless the session ended meanwhile.
    pub(crate) fn record_user(&self, user: User) {
        let phase = self.inner.phase.lock();
        if matches!(*phase, Phase::Anonymous) {
            debug!("Session ended before user profile arrived");
            return;
        }
        self.inner.session.set_user(user);
    }

    // ===== Typed helpers =====

    /// Attach, send, and turn non-2xx statuses into `ApiError`.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let request = self.attach_credential(request);
        let response = self.send(request).await?;
        Self::check_response(response)
    }

    /// Send without credentials or refresh handling.
    pub(crate) async fn request_public(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.inner.transport.execute(&request).await?;
        Self::check_response(response)
    }

    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status(), &response.text()))
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request(ApiRequest::get(path)).await?;
        parse_json(&response, path)
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::post(path)
            .json(body)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        let response = self.request(request).await?;
        parse_json(&response, path)
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::put(path)
            .json(body)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        let response = self.request(request).await?;
        parse_json(&response, path)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.request(ApiRequest::delete(path)).await?;
        Ok(())
    }
}

/// Deserialize a response body. An empty body reads as JSON `null`.
pub(crate) fn parse_json<T: DeserializeOwned>(
    response: &ApiResponse,
    path: &str,
) -> Result<T, ApiError> {
    let body = response.body();
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"null".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| {
        ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
    })
}

/// One refresh exchange plus the write of its result.
struct RefreshTask {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    session: SessionState,
    policy: RefreshPolicy,
    generation: Arc<Mutex<u64>>,
    started_in: u64,
    refresh_token: String,
}

impl RefreshTask {
    async fn run(self) -> Result<String, RefreshError> {
        info!("Refreshing access token");
        let pair = request_refresh(self.transport.as_ref(), &self.policy, &self.refresh_token).await?;

        let generation = self.generation.lock();
        if *generation != self.started_in {
            warn!("Session changed during refresh; discarding refreshed credentials");
            return Err(RefreshError::Superseded);
        }
        self.store
            .replace(pair.clone())
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        self.session.set_access_token(pair.access_token.clone());
        drop(generation);

        info!("Access token refreshed");
        Ok(pair.access_token)
    }
}
