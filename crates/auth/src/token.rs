//! OAuth token endpoint client
//!
//! Handles the two token endpoint interactions:
//! 1. Password login (`grant_type=password`) with the account's long-lived
//!    username and password
//! 2. Token refresh (`grant_type=refresh_token`)
//!
//! Both POST a form to the token endpoint with HTTP basic client auth.
//! Failures are classified through `remote::classify_status`, so a revoked
//! refresh token (400 `invalid_grant`) comes back as `InvalidCredentials`
//! and the credential manager can fall back to a password login.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use remote::{RemoteError, classify_transport, error_for_response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::{Credential, now_millis};
use crate::error::{Error, Result};

/// The authentication endpoint as seen by the credential manager.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn AuthApi>`).
pub trait AuthApi: Send + Sync {
    /// Obtain a fresh credential with the account's password.
    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a Secret<String>,
        scope: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;

    /// Exchange `credential`'s refresh token for a new credential.
    fn refresh<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;
}

/// Response from the token endpoint for both login and refresh.
///
/// `expires_in` is a delta in seconds from the response time; it becomes an
/// absolute unix millisecond timestamp in the resulting `Credential`.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Convert to a credential issued at `now` (unix millis).
    pub fn into_credential(self, fallback_scope: &str, now: u64) -> Credential {
        let scope = self.scope.unwrap_or_else(|| fallback_scope.to_string());
        Credential::new(
            self.access_token,
            self.refresh_token,
            scope,
            now,
            Duration::from_secs(self.expires_in),
        )
    }
}

/// `AuthApi` over HTTP.
#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Secret<String>,
}

impl OAuthClient {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Secret<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// POST `form` to the token endpoint and decode the token response.
    async fn request_token(&self, context: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(self.client_secret.expose()))
            .form(form)
            .send()
            .await
            .map_err(|e| {
                Error::from(RemoteError::new(
                    classify_transport(&e),
                    format!("{context} request failed: {e}"),
                ))
            })?;

        if !response.status().is_success() {
            return Err(error_for_response(context, response).await.into());
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {context} response: {e}")))
    }
}

impl AuthApi for OAuthClient {
    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a Secret<String>,
        scope: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
        Box::pin(async move {
            debug!(username, scope, "requesting password login");
            let token = self
                .request_token(
                    "password login",
                    &[
                        ("grant_type", "password"),
                        ("username", username),
                        ("password", password.expose().as_str()),
                        ("scope", scope),
                    ],
                )
                .await?;
            Ok(token.into_credential(scope, now_millis()))
        })
    }

    fn refresh<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
        Box::pin(async move {
            debug!(scope = %credential.scope, "requesting token refresh");
            let token = self
                .request_token(
                    "token refresh",
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", credential.refresh.expose().as_str()),
                        ("scope", credential.scope.as_str()),
                    ],
                )
                .await?;
            Ok(token.into_credential(&credential.scope, now_millis()))
        })
    }
}
