//! Storage keys and Token Issuer endpoint paths

use std::time::Duration;

/// Storage key for the access (bearer) token
pub const ACCESS_TOKEN_KEY: &str = "authToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Storage key for the optional access token expiry (unix millis)
pub const EXPIRES_AT_KEY: &str = "expiresAt";

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Per-request timeout shared by business calls and the refresh call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
