//! Failure classification for request attempts
//!
//! Maps how an attempt failed onto the recovery path that handles it:
//! 401 goes to the refresh coordinator, "no response received" goes to the
//! retry scheduler, everything else is returned to the caller.
//! Classification is pure; it never triggers recovery itself.

/// How a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A response arrived with a non-2xx status.
    Status { status: u16, body: String },
    /// No response within the request timeout.
    Timeout,
    /// DNS resolution or TCP/TLS connection failed.
    Connect(String),
    /// The connection dropped before a response arrived.
    Aborted(String),
    /// Malformed exchange: undecodable body, invalid request, redirect loop.
    Protocol(String),
}

/// Recovery route for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 401: transparent refresh and replay
    Unauthorized,
    /// No response received: bounded retry
    NetworkTransient,
    /// Surface to the caller
    Terminal,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::Unauthorized => "unauthorized",
            FailureClass::NetworkTransient => "network_transient",
            FailureClass::Terminal => "terminal",
        }
    }
}

impl Failure {
    /// Map a reqwest error. Timeout is checked first: a connect that times
    /// out reports both.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Failure::Timeout
        } else if err.is_connect() {
            Failure::Connect(err.to_string())
        } else if err.is_request() {
            Failure::Aborted(err.to_string())
        } else {
            Failure::Protocol(err.to_string())
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Failure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Human-readable message, preferring the server's `{message}` field.
    pub fn message(&self) -> String {
        match self {
            Failure::Status { status, body } if body.trim().is_empty() => {
                format!("server returned {status}")
            }
            Failure::Status { body, .. } => backoffice_auth::token::server_message(body),
            Failure::Timeout => "request timed out".to_string(),
            Failure::Connect(msg) => format!("connection failed: {msg}"),
            Failure::Aborted(msg) => format!("connection aborted: {msg}"),
            Failure::Protocol(msg) => format!("protocol error: {msg}"),
        }
    }
}

/// Classify a failed attempt.
pub fn classify(failure: &Failure) -> FailureClass {
    match failure {
        Failure::Status { status: 401, .. } => FailureClass::Unauthorized,
        Failure::Status { .. } => FailureClass::Terminal,
        Failure::Timeout | Failure::Connect(_) | Failure::Aborted(_) => {
            FailureClass::NetworkTransient
        }
        Failure::Protocol(_) => FailureClass::Terminal,
    }
}
