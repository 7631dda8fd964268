//! Single-flight token refresh
//!
//! Every request that comes back 401 is handed to `RefreshCoordinator::recover`.
//! The first one in starts a refresh against the Token Issuer; every other one
//! that arrives while that refresh is in flight is queued behind it. When the
//! refresh settles, the queue is drained in arrival order: each waiter either
//! gets its replay (new token) or `AuthInvalid`. Replays carry a `ReplayTurn`
//! chained in queue order, so they are dispatched oldest first even when the
//! callers run on different worker threads.
//!
//! State transitions are a pure function (`handle_event`); the coordinator
//! executes the I/O each action implies.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use backoffice_auth::{CredentialStore, TokenIssuer};
use common::Secret;
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::request::RequestDescriptor;

const SESSION_EVENT_CAPACITY: usize = 16;

const NO_REFRESH_TOKEN: &str = "no refresh token available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// No refresh in flight
    Idle,
    /// One refresh call in flight; new 401s queue behind it
    Refreshing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshEvent {
    /// A request came back 401 and is eligible for one replay
    Unauthorized,
    RefreshSucceeded,
    RefreshFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    /// Queue the request and start the refresh call
    EnqueueAndRefresh,
    /// Queue the request behind the refresh already in flight
    Enqueue,
    /// Hand every waiter its replay, oldest first
    ReplayWaiters,
    /// Reject every waiter with `AuthInvalid`, oldest first, then signal
    /// the end of the session
    EndSession,
    None,
}

/// Emitted to subscribers when the session can no longer be recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Refresh failed and stored credentials were cleared, or a request was
    /// rejected with no session stored. Sent once per ended session, however
    /// many requests were waiting on it or come back 401 afterwards.
    Ended { reason: String },
}

/// Pure transition function.
pub fn handle_event(state: RefreshState, event: RefreshEvent) -> (RefreshState, RefreshAction) {
    match (state, event) {
        (RefreshState::Idle, RefreshEvent::Unauthorized) => {
            (RefreshState::Refreshing, RefreshAction::EnqueueAndRefresh)
        }
        (RefreshState::Refreshing, RefreshEvent::Unauthorized) => {
            (RefreshState::Refreshing, RefreshAction::Enqueue)
        }
        (RefreshState::Refreshing, RefreshEvent::RefreshSucceeded) => {
            (RefreshState::Idle, RefreshAction::ReplayWaiters)
        }
        (RefreshState::Refreshing, RefreshEvent::RefreshFailed) => {
            (RefreshState::Idle, RefreshAction::EndSession)
        }
        // A refresh result with nothing in flight has nobody to deliver to
        (RefreshState::Idle, RefreshEvent::RefreshSucceeded | RefreshEvent::RefreshFailed) => {
            (RefreshState::Idle, RefreshAction::None)
        }
    }
}

/// A waiter's place in the replay order.
///
/// `dispatch` waits until the previous replay has started sending, starts
/// this one, then lets the next go. A turn whose caller gives up is passed on
/// when dropped.
#[derive(Debug, Default)]
pub struct ReplayTurn {
    wait: Option<oneshot::Receiver<()>>,
    pass: Option<oneshot::Sender<()>>,
}

impl ReplayTurn {
    /// Run `send` in turn. The next turn opens once `send` has been polled
    /// for the first time.
    pub async fn dispatch<F: Future>(mut self, send: F) -> F::Output {
        if let Some(wait) = self.wait.take() {
            // A dropped predecessor opens the turn too
            let _ = wait.await;
        }
        let mut send = std::pin::pin!(send);
        let mut pass = self.pass.take();
        std::future::poll_fn(|cx| {
            let poll = send.as_mut().poll(cx);
            if let Some(pass) = pass.take() {
                let _ = pass.send(());
            }
            poll
        })
        .await
    }
}

/// A request to re-send after a 401, and when it may go.
#[derive(Debug)]
pub struct Replay {
    pub request: RequestDescriptor,
    pub turn: ReplayTurn,
}

impl Replay {
    /// Replay that needs no ordering against other waiters.
    fn immediate(request: RequestDescriptor) -> Self {
        Self {
            request: request.for_auth_replay(),
            turn: ReplayTurn::default(),
        }
    }
}

struct Waiter {
    request: RequestDescriptor,
    reply: oneshot::Sender<Result<Replay>>,
}

struct Inner {
    state: RefreshState,
    waiters: VecDeque<Waiter>,
    /// `SessionEvent::Ended` already sent for the current session
    ended: bool,
}

/// Resolve every waiter in queue order. Returns the request ids in the order
/// they were resolved.
///
/// `Ok(())` hands each waiter its replay, each turn chained behind the one
/// before it; `Err(reason)` rejects each with `AuthInvalid`. A waiter whose
/// caller has gone away is skipped and its turn passes straight on.
fn drain(waiters: VecDeque<Waiter>, outcome: &std::result::Result<(), String>) -> Vec<String> {
    let mut order = Vec::with_capacity(waiters.len());
    let mut wait = None;
    for waiter in waiters {
        let id = waiter.request.id().to_string();
        let reply = match outcome {
            Ok(()) => {
                let (pass, next) = oneshot::channel();
                Ok(Replay {
                    request: waiter.request.for_auth_replay(),
                    turn: ReplayTurn {
                        wait: wait.replace(next),
                        pass: Some(pass),
                    },
                })
            }
            Err(reason) => Err(Error::AuthInvalid(reason.clone())),
        };
        if waiter.reply.send(reply).is_err() {
            debug!(request_id = %id, "waiter dropped before refresh settled");
        }
        order.push(id);
    }
    order
}

/// Coordinates token refresh across all concurrent requests of one client.
pub struct RefreshCoordinator {
    inner: Mutex<Inner>,
    store: Arc<CredentialStore>,
    issuer: Arc<dyn TokenIssuer>,
    events: broadcast::Sender<SessionEvent>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, issuer: Arc<dyn TokenIssuer>) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                state: RefreshState::Idle,
                waiters: VecDeque::new(),
                ended: false,
            }),
            store,
            issuer,
            events,
        }
    }

    /// Subscribe to session events. Only events sent after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> RefreshState {
        self.inner.lock().await.state
    }

    /// Number of requests waiting on the current refresh.
    pub async fn queued(&self) -> usize {
        self.inner.lock().await.waiters.len()
    }

    /// Mark the start of a new session (after login), so its end is signalled
    /// again.
    pub async fn session_started(&self) {
        self.inner.lock().await.ended = false;
    }

    /// Recover a request that came back 401.
    ///
    /// Returns the replay (request flagged `retried_for_auth`, plus its turn
    /// in the replay order) once a new token is stored. `sent_with` is the
    /// token the failed attempt carried; if the store already holds a
    /// different one, an earlier refresh has replaced it and the request is
    /// replayed without a new refresh call.
    ///
    /// Errors:
    /// - `Terminal` (401) if the request was already replayed once
    /// - `AuthInvalid` if the refresh failed; credentials are cleared by then
    /// - `AuthInvalid` without a refresh if no session is stored. The session
    ///   is signalled as ended unless that was already done for it.
    pub async fn recover(
        self: &Arc<Self>,
        request: RequestDescriptor,
        sent_with: Option<&Secret<String>>,
    ) -> Result<Replay> {
        if request.retried_for_auth() {
            return Err(Error::Terminal {
                status: Some(401),
                message: "unauthorized after token refresh".to_string(),
            });
        }

        let rx = {
            let mut inner = self.inner.lock().await;

            if inner.state == RefreshState::Idle {
                // Nothing stored: never logged in, logged out, or an earlier
                // failed refresh already ended the session
                let Some(current) = self.store.access_token().await else {
                    debug!(request_id = request.id(), "no stored session to refresh");
                    if !inner.ended {
                        inner.ended = true;
                        self.signal_ended(NO_REFRESH_TOKEN.to_string());
                    }
                    return Err(Error::AuthInvalid("not logged in".to_string()));
                };
                inner.ended = false;
                if sent_with != Some(&current) {
                    debug!(request_id = request.id(), "token already refreshed, replaying");
                    return Ok(Replay::immediate(request));
                }
            }

            let (next, action) = handle_event(inner.state, RefreshEvent::Unauthorized);
            inner.state = next;

            let (reply, rx) = oneshot::channel();
            debug!(
                request_id = request.id(),
                queued = inner.waiters.len() + 1,
                "request waiting on token refresh"
            );
            inner.waiters.push_back(Waiter { request, reply });

            if action == RefreshAction::EnqueueAndRefresh {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move { coordinator.run_refresh().await });
            }
            rx
        };

        rx.await
            .unwrap_or_else(|_| Err(Error::AuthInvalid("token refresh was abandoned".to_string())))
    }

    async fn run_refresh(self: Arc<Self>) {
        info!("access token rejected, refreshing");

        match self.refresh_tokens().await {
            Ok(()) => {
                crate::metrics::record_refresh("success");
                info!("token refresh succeeded");
                self.settle(RefreshEvent::RefreshSucceeded, Ok(())).await;
            }
            Err(e) => {
                crate::metrics::record_refresh("failure");
                warn!(error = %e, "token refresh failed, ending session");
                // Clear before any waiter learns the outcome, so no caller
                // can observe AuthInvalid while the dead pair is still stored.
                if let Err(clear_err) = self.store.clear().await {
                    warn!(error = %clear_err, "failed to persist cleared credentials");
                }
                self.settle(RefreshEvent::RefreshFailed, Err(e.to_string()))
                    .await;
            }
        }
    }

    /// One refresh call. Never retried: a network failure here ends the
    /// session the same way a rejection does.
    async fn refresh_tokens(&self) -> backoffice_auth::Result<()> {
        let current = self
            .store
            .get()
            .await
            .ok_or(backoffice_auth::Error::MissingRefreshToken)?;

        let pair = self.issuer.refresh(current.refresh_token.expose()).await?;

        // The in-memory pair is already replaced even if the write failed
        if let Err(e) = self.store.set(pair).await {
            warn!(error = %e, "refreshed tokens kept in memory only");
        }
        Ok(())
    }

    async fn settle(&self, event: RefreshEvent, outcome: std::result::Result<(), String>) {
        let (action, waiters) = {
            let mut inner = self.inner.lock().await;
            let (next, action) = handle_event(inner.state, event);
            inner.state = next;
            if action == RefreshAction::EndSession {
                inner.ended = true;
            }
            (action, std::mem::take(&mut inner.waiters))
        };

        match action {
            RefreshAction::ReplayWaiters => {
                let order = drain(waiters, &outcome);
                debug!(replayed = order.len(), "replaying queued requests");
            }
            RefreshAction::EndSession => {
                let order = drain(waiters, &outcome);
                let reason = outcome.err().unwrap_or_default();
                warn!(rejected = order.len(), reason = %reason, "session ended");
                self.signal_ended(reason);
            }
            other => {
                warn!(?event, ?other, "refresh settled with no refresh in flight");
            }
        }
    }

    fn signal_ended(&self, reason: String) {
        crate::metrics::record_session_ended();
        // No subscribers is fine
        let _ = self.events.send(SessionEvent::Ended { reason });
    }
}
