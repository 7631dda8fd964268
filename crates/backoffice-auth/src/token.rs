//! Token Issuer contract and its HTTP client
//!
//! Three endpoints, all JSON:
//! - `POST /auth/login` `{username, password}` → `{token, refreshToken, user}`
//! - `POST /auth/refresh` `{refreshToken}` → `{token, refreshToken}`
//! - `POST /auth/logout` with `Authorization: Bearer` → `{message}`
//!
//! A 401 from login or refresh maps to `Error::Rejected`. These calls never go
//! through the transport's recovery pipeline: a rejected refresh must end the
//! session, not trigger another refresh.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
use crate::credentials::{TokenPair, now_millis};
use crate::error::{Error, Result};

/// Boxed future returned by `TokenIssuer` methods.
pub type IssuerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Successful login: the new pair plus the issuer's user record.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub user: serde_json::Value,
}

/// Server side of the session: exchanges credentials or a refresh token for a
/// new token pair.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenIssuer>`), so tests can swap in a scripted issuer.
pub trait TokenIssuer: Send + Sync {
    fn login<'a>(&'a self, username: &'a str, password: &'a str) -> IssuerFuture<'a, LoginOutcome>;

    /// Exchange a refresh token for a new pair. Single attempt, never retried.
    ///
    /// If the issuer does not rotate the refresh token, the returned pair
    /// carries the one that was presented.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> IssuerFuture<'a, TokenPair>;

    /// Revoke the refresh token on record for the bearer of `access_token`.
    fn logout<'a>(&'a self, access_token: &'a str) -> IssuerFuture<'a, ()>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Body of a successful login.
///
/// `expires_in` is an optional lifetime in seconds; the server this client
/// targets does not always send it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    refresh_token: String,
    #[serde(default)]
    user: serde_json::Value,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
}

/// `TokenIssuer` over HTTP.
///
/// The `reqwest::Client` should be built with the same timeout as business
/// calls; the refresh call gets no special treatment.
#[derive(Clone)]
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenIssuer {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn login_inner(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidInput(
                "username and password are required".into(),
            ));
        }

        let response = self
            .client
            .post(self.endpoint(LOGIN_PATH))
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| Error::Http(format!("login request failed: {e}")))?;
        let response = check_status(response, "login").await?;

        let body = response
            .json::<LoginResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("invalid login response: {e}")))?;

        let mut tokens = TokenPair::new(body.token, body.refresh_token);
        if let Some(expires_at) = body.expires_in.and_then(expiry_from) {
            tokens = tokens.with_expiry(expires_at);
        }
        debug!(username, "login accepted");
        Ok(LoginOutcome {
            tokens,
            user: body.user,
        })
    }

    async fn refresh_inner(&self, refresh_token: &str) -> Result<TokenPair> {
        let response = self
            .client
            .post(self.endpoint(REFRESH_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;
        let response = check_status(response, "token refresh").await?;

        let body = response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("invalid refresh response: {e}")))?;

        let rotated = body
            .refresh_token
            .unwrap_or_else(|| refresh_token.to_owned());
        let mut tokens = TokenPair::new(body.token, rotated);
        if let Some(expires_at) = body.expires_in.and_then(expiry_from) {
            tokens = tokens.with_expiry(expires_at);
        }
        Ok(tokens)
    }

    async fn logout_inner(&self, access_token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(LOGOUT_PATH))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;
        check_status(response, "logout").await?;
        Ok(())
    }
}

impl TokenIssuer for HttpTokenIssuer {
    fn login<'a>(&'a self, username: &'a str, password: &'a str) -> IssuerFuture<'a, LoginOutcome> {
        Box::pin(self.login_inner(username, password))
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> IssuerFuture<'a, TokenPair> {
        Box::pin(self.refresh_inner(refresh_token))
    }

    fn logout<'a>(&'a self, access_token: &'a str) -> IssuerFuture<'a, ()> {
        Box::pin(self.logout_inner(access_token))
    }
}

/// Pass a 2xx response through; turn anything else into an error carrying
/// the server's `message` when the body has one.
/// Absolute expiry in unix millis for a lifetime of `expires_in` seconds.
///
/// A lifetime too large to represent is treated as no expiry.
fn expiry_from(expires_in: u64) -> Option<u64> {
    expires_in
        .checked_mul(1000)
        .and_then(|ms| now_millis().checked_add(ms))
}

async fn check_status(response: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    let message = server_message(&body);

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::Rejected(format!(
            "{operation} rejected ({status}): {message}"
        )));
    }
    Err(Error::Status {
        status: status.as_u16(),
        message,
    })
}

/// Extract `{"message": ...}` from an error body, falling back to the raw text.
pub fn server_message(body: &str) -> String {
    serde_json::from_str::<MessageBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.to_owned())
}
