//! Session credentials for the back-office API
//!
//! Owns the two pieces of client state the transport depends on: the
//! persisted token pair (`CredentialStore`) and the contract of the server
//! that issues it (`TokenIssuer`). The transport crate never writes tokens
//! itself; it goes through these types.
//!
//! Session flow:
//! 1. `TokenIssuer::login()` exchanges username/password for a `TokenPair`
//! 2. Pair stored via `CredentialStore::set()`
//! 3. On a 401 the refresh coordinator calls `TokenIssuer::refresh()` once
//! 4. Success replaces the pair; failure calls `CredentialStore::clear()`
//! 5. `TokenIssuer::logout()` revokes the refresh token server-side

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialStore, TokenPair, now_millis};
pub use error::{Error, Result};
pub use token::{HttpTokenIssuer, LoginOutcome, TokenIssuer};
