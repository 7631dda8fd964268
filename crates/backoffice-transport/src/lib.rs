//! Resilient HTTP transport for the back-office API
//!
//! Every business call goes through one pipeline (`ApiClient::execute`):
//! 1. `interceptor` attaches the stored access token as a Bearer header
//! 2. `transport` sends the request
//! 3. On failure, `classify` labels it Unauthorized, NetworkTransient or Terminal
//! 4. NetworkTransient → `retry` re-sends with linear backoff, at most 3 times
//! 5. Unauthorized → `refresh` queues the request behind a single refresh call
//!    and replays it with the new token in queue order, or rejects it with
//!    `AuthInvalid`
//! 6. Terminal → surfaced to the caller as-is
//!
//! The refresh coordinator is the only writer of the credential store on the
//! request path and the only source of `SessionEvent::Ended`.

pub mod classify;
pub mod client;
pub mod error;
pub mod interceptor;
pub mod metrics;
pub mod refresh;
pub mod request;
pub mod retry;
pub mod transport;

pub use classify::{Failure, FailureClass, classify};
pub use client::{ApiClient, ClientConfig};
pub use error::{Error, ErrorKind, Result};
pub use interceptor::{PreparedRequest, authorize};
pub use refresh::{RefreshCoordinator, RefreshState, Replay, ReplayTurn, SessionEvent};
pub use request::{ApiResponse, RequestDescriptor};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{ReqwestTransport, Transport};
