//! Credential storage for the session token pair
//!
//! Holds the current access/refresh token pair in memory and mirrors it to a
//! JSON file under the fixed keys `authToken` and `refreshToken`. All writes
//! use atomic temp-file + rename so a crash never leaves half a pair on disk.
//! A tokio Mutex serializes concurrent writers (login, refresh, logout).
//!
//! Tokens are opaque: the store never inspects or validates them.

use std::path::{Path, PathBuf};

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Access/refresh token pair issued by the Token Issuer.
///
/// `expires_at` is a unix timestamp in milliseconds, present only when the
/// issuer reported a lifetime for the access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: Option<u64>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the access token is known to have expired. Pairs without an
    /// expiry are never considered expired; the server decides with a 401.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }
}

/// On-disk layout. Either token missing means "logged out".
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(rename = "authToken", default, skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    #[serde(
        rename = "refreshToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    refresh_token: Option<String>,
    #[serde(rename = "expiresAt", default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

impl StoredTokens {
    fn into_pair(self) -> Option<TokenPair> {
        match (self.auth_token, self.refresh_token) {
            (Some(access), Some(refresh)) => Some(TokenPair {
                access_token: Secret::new(access),
                refresh_token: Secret::new(refresh),
                expires_at: self.expires_at,
            }),
            _ => None,
        }
    }

    fn from_pair(pair: Option<&TokenPair>) -> Self {
        match pair {
            Some(pair) => Self {
                auth_token: Some(pair.access_token.expose().clone()),
                refresh_token: Some(pair.refresh_token.expose().clone()),
                expires_at: pair.expires_at,
            },
            None => Self::default(),
        }
    }
}

/// Thread-safe holder of the session token pair.
///
/// Reads clone the pair out under a brief lock. `set` and `clear` replace the
/// whole pair at once, so a reader never observes an access token from one
/// pair with the refresh token of another.
pub struct CredentialStore {
    path: Option<PathBuf>,
    state: Mutex<Option<TokenPair>>,
}

impl CredentialStore {
    /// Load the token pair from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` and starts logged out.
    /// A file holding only one of the two tokens also loads as logged out.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let stored: StoredTokens = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            let pair = stored.into_pair();
            info!(path = %path.display(), logged_in = pair.is_some(), "loaded credentials");
            pair
        } else {
            info!(path = %path.display(), "credential file not found, starting logged out");
            write_atomic(&path, &StoredTokens::default()).await?;
            None
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// In-memory store with no backing file.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            state: Mutex::new(None),
        }
    }

    /// In-memory store pre-populated with a pair.
    pub fn ephemeral_with(pair: TokenPair) -> Self {
        Self {
            path: None,
            state: Mutex::new(Some(pair)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get a clone of the current pair, or `None` when logged out.
    pub async fn get(&self) -> Option<TokenPair> {
        self.state.lock().await.clone()
    }

    /// Current access token, if any.
    pub async fn access_token(&self) -> Option<Secret<String>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Replace the pair and persist it.
    ///
    /// The in-memory pair is replaced even if persisting fails, so the running
    /// process keeps working with the tokens it was just issued.
    pub async fn set(&self, pair: TokenPair) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = Some(pair);
        debug!("stored token pair");
        self.persist(state.as_ref()).await
    }

    /// Drop the pair and persist the logged-out state.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            debug!("cleared token pair");
        }
        self.persist(None).await
    }

    async fn persist(&self, pair: Option<&TokenPair>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let result = write_atomic(path, &StoredTokens::from_pair(pair)).await;
        if let Err(e) = &result {
            warn!(path = %path.display(), error = %e, "failed to persist credentials");
        }
        result
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write the token file atomically.
///
/// Writes to a uniquely named temporary file in the same directory, then
/// renames it over the target. Stores sharing a directory never share a temp
/// file. Permissions are 0600 since the file holds bearer tokens.
async fn write_atomic(path: &Path, data: &StoredTokens) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_and_persist(&target, json.as_bytes()))
        .await
        .map_err(|e| Error::Io(format!("credential write task failed: {e}")))??;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

fn write_and_persist(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".credentials.")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::Io(format!("creating temp credential file: {e}")))?;

    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(tmp.path(), perms)
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tmp.persist(path)
        .map_err(|e| Error::Io(format!("renaming temp credential file: {}", e.error)))?;
    Ok(())
}
