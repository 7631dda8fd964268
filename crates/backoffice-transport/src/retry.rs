//! Retry scheduler for network-transient failures
//!
//! Linear backoff: retry k (1-based) waits `base_delay * k`. With the
//! defaults that is 1s, 2s, 3s, after which the request fails with
//! `NetworkPermanent`. Status-bearing failures never reach this module.

use std::time::Duration;

use crate::request::RequestDescriptor;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// What to do with a request whose attempt got no response.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Wait `delay`, then send `next`.
    Retry {
        delay: Duration,
        next: RequestDescriptor,
    },
    /// Budget spent. `attempts` counts every send, the original included.
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry `k` (1-based).
    pub fn delay_for(&self, k: u32) -> Duration {
        self.base_delay.saturating_mul(k)
    }

    pub fn schedule(&self, descriptor: &RequestDescriptor) -> RetryDecision {
        if descriptor.attempt() >= self.max_retries {
            return RetryDecision::Exhausted {
                attempts: descriptor.attempt() + 1,
            };
        }
        let next = descriptor.next_attempt();
        RetryDecision::Retry {
            delay: self.delay_for(next.attempt()),
            next,
        }
    }
}
