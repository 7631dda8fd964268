//! Error types for session credential operations

/// Errors from the credential store and the Token Issuer client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The issuer answered 401: bad username/password, or a refresh token
    /// that is expired or no longer the one on record.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    #[error("token issuer returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid token issuer response: {0}")]
    InvalidResponse(String),

    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
