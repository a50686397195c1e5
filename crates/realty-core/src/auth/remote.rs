//! Remote auth API endpoints.
//!
//! Sign-in, refresh, email verification and the password reset flow.
//! Only `fetch_current_user` goes through the refreshing `send` path;
//! the others are made without credentials.

use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::client::parse_json;
use crate::api::error::truncate_body;
use crate::api::request::bearer_header;
use crate::api::{ApiError, ApiRequest, ApiResponse, RefreshError, SessionClient, Transport};
use crate::config::RefreshPolicy;

use super::credentials::CredentialPair;
use super::models::{
    CurrentUserResponse, EmailTokenRequest, ForgotPasswordRequest, RefreshResponse,
    ResetPasswordRequest, SignInRequest, SignInResponse, User, VerifyEmailResponse,
};

pub(crate) const SIGN_IN_PATH: &str = "/auth/signin";
pub(crate) const REFRESH_PATH: &str = "/auth/session/refresh";
pub(crate) const CURRENT_USER_PATH: &str = "/auth/me";
const VERIFY_EMAIL_PATH: &str = "/auth/verify-email";
const FORGOT_PASSWORD_PATH: &str = "/auth/forgot-password";
const VERIFY_RESET_TOKEN_PATH: &str = "/auth/verify-reset-token";
const RESET_PASSWORD_PATH: &str = "/auth/reset-password";

/// Exchange `refresh_token` for a new pair.
///
/// 429, 5xx and transport failures are retried per `policy`; any other
/// non-2xx status is final.
pub(crate) async fn request_refresh(
    transport: &dyn Transport,
    policy: &RefreshPolicy,
    refresh_token: &str,
) -> Result<CredentialPair, RefreshError> {
    let request = ApiRequest::post(REFRESH_PATH).json_value(json!({ "refresh_token": refresh_token }));

    let mut retries = 0;
    loop {
        let error = match transport.execute(&request).await {
            Ok(response) if response.is_success() => {
                return parse_refresh(&response, refresh_token);
            }
            Ok(response) => {
                let status = response.status();
                let error = RefreshError::RemoteRejected {
                    status: status.as_u16(),
                    body: truncate_body(&response.text()),
                };
                if !is_transient(status) {
                    return Err(error);
                }
                error
            }
            Err(e) => RefreshError::Network(e.to_string()),
        };

        if retries >= policy.max_transient_retries {
            return Err(error);
        }
        retries += 1;
        let backoff = policy.backoff(retries);
        warn!(
            retry = retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Transient refresh failure, backing off"
        );
        tokio::time::sleep(backoff).await;
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn parse_refresh(response: &ApiResponse, previous: &str) -> Result<CredentialPair, RefreshError> {
    let parsed: RefreshResponse = response
        .json()
        .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
    let rotated = parsed.refresh_token.is_some();
    let pair = CredentialPair::new(
        parsed.access_token,
        parsed.refresh_token.unwrap_or_else(|| previous.to_string()),
    );
    validate_pair(&pair).map_err(RefreshError::InvalidResponse)?;
    debug!(rotated, "Refresh response accepted");
    Ok(pair)
}

/// Tokens must be non-empty and usable as a header value.
fn validate_pair(pair: &CredentialPair) -> Result<(), String> {
    if pair.access_token.is_empty() || pair.refresh_token.is_empty() {
        return Err("empty token in response".to_string());
    }
    bearer_header(&pair.access_token)
        .map_err(|_| "access token is not a valid header value".to_string())?;
    Ok(())
}

fn invalid_request(e: serde_json::Error) -> ApiError {
    ApiError::InvalidRequest(e.to_string())
}

impl SessionClient {
    /// Authenticate and start a session. Returns the user if the API sent one.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Option<User>, ApiError> {
        let request = ApiRequest::post(SIGN_IN_PATH)
            .json(&SignInRequest { email, password })
            .map_err(invalid_request)?;

        let response = match self.request_public(request).await {
            Ok(response) => response,
            Err(ApiError::Unauthorized) => return Err(ApiError::InvalidCredentials),
            Err(e) => return Err(e),
        };

        let parsed: SignInResponse = parse_json(&response, SIGN_IN_PATH)?;
        let pair = CredentialPair::new(parsed.access_token, parsed.refresh_token);
        validate_pair(&pair).map_err(ApiError::InvalidResponse)?;

        self.install_credentials(pair, parsed.user.clone())?;
        info!(has_user = parsed.user.is_some(), "Signed in");
        Ok(parsed.user)
    }

    /// End the session locally.
    pub fn sign_out(&self) {
        self.force_logout();
    }

    /// Ask the API who the current credential belongs to and record it.
    pub async fn fetch_current_user(&self) -> Result<User, ApiError> {
        let response = self.request(ApiRequest::get(CURRENT_USER_PATH)).await?;
        let user = parse_json::<CurrentUserResponse>(&response, CURRENT_USER_PATH)?.into_user();
        self.record_user(user.clone());
        Ok(user)
    }

    pub async fn verify_email(
        &self,
        email: &str,
        token: &str,
    ) -> Result<VerifyEmailResponse, ApiError> {
        let request = ApiRequest::post(VERIFY_EMAIL_PATH)
            .json(&EmailTokenRequest { email, token })
            .map_err(invalid_request)?;
        let response = self.request_public(request).await?;

        // Some deployments answer 200 with no body
        let parsed: Option<VerifyEmailResponse> = parse_json(&response, VERIFY_EMAIL_PATH)?;
        Ok(parsed.unwrap_or(VerifyEmailResponse {
            success: true,
            message: None,
        }))
    }

    pub async fn forgot_password(&self, email: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(FORGOT_PASSWORD_PATH)
            .json(&ForgotPasswordRequest { email })
            .map_err(invalid_request)?;
        self.request_public(request).await?;
        Ok(())
    }

    pub async fn verify_reset_token(&self, email: &str, token: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(VERIFY_RESET_TOKEN_PATH)
            .json(&EmailTokenRequest { email, token })
            .map_err(invalid_request)?;
        self.request_public(request).await?;
        Ok(())
    }

    pub async fn reset_password(
        &self,
        email: &str,
        token: &str,
        password: &str,
    ) -> Result<(), ApiError> {
        let request = ApiRequest::post(RESET_PASSWORD_PATH)
            .json(&ResetPasswordRequest {
                email,
                token,
                password,
            })
            .map_err(invalid_request)?;
        self.request_public(request).await?;
        Ok(())
    }
}
