//! Transport metrics
//!
//! Emitted through the `metrics` facade; the embedding application decides
//! whether to install a recorder. Without one every call is a no-op.
//!
//! - `transport_requests_total` (counter): label `outcome`
//! - `transport_request_duration_seconds` (histogram): label `outcome`
//! - `transport_retries_total` (counter)
//! - `transport_refresh_total` (counter): label `outcome`
//! - `transport_session_ended_total` (counter)

/// Record a finished logical request. `outcome` is `success` or an
/// `ErrorKind` label.
pub fn record_request(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("transport_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!("transport_request_duration_seconds", "outcome" => outcome)
        .record(duration_secs);
}

/// Record one scheduled network retry.
pub fn record_retry() {
    metrics::counter!("transport_retries_total").increment(1);
}

/// Record one refresh call against the Token Issuer.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("transport_refresh_total", "outcome" => outcome).increment(1);
}

pub fn record_session_ended() {
    metrics::counter!("transport_session_ended_total").increment(1);
}
