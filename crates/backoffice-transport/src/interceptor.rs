//! Request interceptor: attaches the stored access token
//!
//! Runs at the start of every attempt, including replays after a refresh, so
//! each attempt carries whatever token the credential store holds right now.

use backoffice_auth::CredentialStore;
use common::Secret;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use tracing::warn;

use crate::request::RequestDescriptor;

/// A descriptor plus the headers computed for this attempt.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub descriptor: RequestDescriptor,
    pub headers: HeaderMap,
    /// Access token attached to this attempt. The refresh coordinator compares
    /// it against the store to spot 401s for tokens that were already replaced.
    pub sent_with: Option<Secret<String>>,
}

/// Build the headers for one attempt.
///
/// Starts from the descriptor's own headers, adds `Content-Type` for JSON
/// bodies, and sets `Authorization: Bearer <token>` when a token is given.
/// No token means the request goes out unauthenticated; that is not an error.
pub fn authorize(
    descriptor: RequestDescriptor,
    access_token: Option<Secret<String>>,
) -> PreparedRequest {
    let mut headers = descriptor.headers().clone();

    if descriptor.body().is_some() && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    let sent_with = match access_token {
        Some(token) => match HeaderValue::from_str(&format!("Bearer {}", token.expose())) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                Some(token)
            }
            Err(e) => {
                // Unusable token: send without it and let the 401 path refresh
                warn!(request_id = descriptor.id(), error = %e, "stored access token is not a valid header value");
                None
            }
        },
        None => None,
    };

    PreparedRequest {
        descriptor,
        headers,
        sent_with,
    }
}

/// Read the store and authorize the descriptor.
pub async fn intercept(store: &CredentialStore, descriptor: RequestDescriptor) -> PreparedRequest {
    authorize(descriptor, store.access_token().await)
}
