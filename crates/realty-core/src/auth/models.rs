//! Remote auth API payloads.
//!
//! The API has been seen to answer in both snake_case and camelCase, so
//! token fields accept either spelling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authenticated user as returned by the API. Opaque to the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct User(Value);

impl User {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// User id, whether the API sent it as a string or a number.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id").or_else(|| self.0.get("_id"))? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.0.get("email").and_then(Value::as_str)
    }

    pub fn role(&self) -> Option<&str> {
        self.0.get("role").and_then(Value::as_str)
    }

    /// Name for display: `name`, else first + last, else email.
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.0.get("name").and_then(Value::as_str) {
            return Some(name.to_string());
        }
        let first = self
            .0
            .get("first_name")
            .or_else(|| self.0.get("firstName"))
            .and_then(Value::as_str);
        let last = self
            .0
            .get("last_name")
            .or_else(|| self.0.get("lastName"))
            .and_then(Value::as_str);
        match (first, last) {
            (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
            (Some(n), None) | (None, Some(n)) => Some(n.to_string()),
            (None, None) => self.email().map(str::to_string),
        }
    }
}

// ===== Requests =====

#[derive(Debug, Serialize)]
pub(crate) struct SignInRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmailTokenRequest<'a> {
    pub email: &'a str,
    pub token: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ForgotPasswordRequest<'a> {
    pub email: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResetPasswordRequest<'a> {
    pub email: &'a str,
    pub token: &'a str,
    pub password: &'a str,
}

// ===== Responses =====

#[derive(Debug, Deserialize)]
pub(crate) struct SignInResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken")]
    pub refresh_token: String,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    /// Absent when the server does not rotate refresh tokens.
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum CurrentUserResponse {
    Wrapped { user: User },
    Bare(User),
}

impl CurrentUserResponse {
    pub fn into_user(self) -> User {
        match self {
            CurrentUserResponse::Wrapped { user } | CurrentUserResponse::Bare(user) => user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
