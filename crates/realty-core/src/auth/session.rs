use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use super::credentials::{CredentialStore, MemoryCredentialStore};
use super::models::User;

/// What the UI layer reads: `{ is_authenticated, user, access_token }`.
#[derive(Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub is_authenticated: bool,
    pub user: Option<User>,
    pub access_token: Option<String>,
}

impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("is_authenticated", &self.is_authenticated)
            .field("user", &self.user)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Observable session state. Cloning shares the same state.
///
/// `is_authenticated` is derived from the access token on every write, so
/// it is true exactly when a token is present.
#[derive(Clone)]
pub struct SessionState {
    tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    /// Receive every change to the session.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_authenticated
    }

    pub fn user(&self) -> Option<User> {
        self.tx.borrow().user.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().access_token.clone()
    }

    pub(crate) fn set_access_token(&self, token: String) {
        self.tx.send_modify(|s| {
            s.access_token = Some(token);
            s.is_authenticated = true;
        });
    }

    pub(crate) fn set_user(&self, user: User) {
        self.tx.send_modify(|s| s.user = Some(user));
    }

    pub(crate) fn establish(&self, token: String, user: Option<User>) {
        self.tx.send_replace(SessionSnapshot {
            is_authenticated: true,
            user,
            access_token: Some(token),
        });
    }

    pub(crate) fn clear(&self) {
        self.tx.send_replace(SessionSnapshot::default());
    }
}

/// Everything the session client shares with the rest of the application:
/// the credential store and the session state. Passed to the client
/// constructor; nothing is process-global.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn CredentialStore>,
    pub session: SessionState,
}

impl SessionContext {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            session: SessionState::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_authenticated_follows_access_token() {
        let state = SessionState::new();
        assert!(!state.is_authenticated());

        state.set_access_token("a".into());
        assert!(state.is_authenticated());
        assert!(state.user().is_none());

        state.set_user(User::new(json!({"email": "dev@example.com"})));
        state.clear();
        let snapshot = state.snapshot();
        assert_eq!(snapshot, SessionSnapshot::default());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let state = SessionState::new();
        let mut rx = state.subscribe();

        state.establish("a".into(), Some(User::new(json!({"id": 1}))));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_authenticated);

        state.clear();
        rx.changed().await.unwrap();
        assert!(!rx.borrow().is_authenticated);
    }

    #[test]
    fn test_clones_share_state() {
        let state = SessionState::new();
        let other = state.clone();
        state.set_access_token("a".into());
        assert_eq!(other.access_token().as_deref(), Some("a"));
    }

    #[test]
    fn test_snapshot_debug_hides_token() {
        let state = SessionState::new();
        state.set_access_token("very-secret".into());
        assert!(!format!("{:?}", state.snapshot()).contains("very-secret"));
    }
}
