//! Error types surfaced to callers of the transport

use crate::classify::Failure;

/// Final failure of one logical request.
///
/// Unauthorized and NetworkTransient never appear here: they are recovered
/// inside the pipeline, and only their recovery failures surface
/// (`AuthInvalid`, `NetworkPermanent`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The token refresh failed; credentials were cleared.
    #[error("authentication invalid: {0}")]
    AuthInvalid(String),

    #[error("network failure after {attempts} attempts: {message}")]
    NetworkPermanent { attempts: u32, message: String },

    /// Any other 4xx/5xx, a protocol error, or a 401 on a request that was
    /// already replayed after a refresh.
    #[error("request failed{}: {message}", status_suffix(.status))]
    Terminal { status: Option<u16>, message: String },

    /// Login/logout against the Token Issuer, or the credential store.
    #[error("session error: {0}")]
    Session(#[from] backoffice_auth::Error),

    #[error("client setup failed: {0}")]
    Setup(String),
}

/// Error kind without payload, for matching and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthInvalid,
    NetworkPermanent,
    Terminal,
    Session,
    Setup,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::AuthInvalid => "auth_invalid",
            ErrorKind::NetworkPermanent => "network_permanent",
            ErrorKind::Terminal => "terminal",
            ErrorKind::Session => "session",
            ErrorKind::Setup => "setup",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AuthInvalid(_) => ErrorKind::AuthInvalid,
            Error::NetworkPermanent { .. } => ErrorKind::NetworkPermanent,
            Error::Terminal { .. } => ErrorKind::Terminal,
            Error::Session(_) => ErrorKind::Session,
            Error::Setup(_) => ErrorKind::Setup,
        }
    }

    /// HTTP status of the response that ended the request, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Terminal { status, .. } => *status,
            Error::Session(backoffice_auth::Error::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn terminal(failure: &Failure) -> Self {
        Error::Terminal {
            status: failure.status(),
            message: failure.message(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
