//! API client: the request pipeline plus session entry points
//!
//! `execute` runs one logical request through intercept → send → classify and
//! loops on recovery: a NetworkTransient failure is re-sent after a backoff
//! delay, an Unauthorized one waits on the refresh coordinator and is replayed
//! with the new token. Each iteration re-reads the credential store, so a
//! replay always carries the freshest token. Replays that waited on the same
//! refresh are dispatched in the order they were queued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoffice_auth::{CredentialStore, DEFAULT_TIMEOUT, HttpTokenIssuer, TokenIssuer};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::classify::{FailureClass, classify};
use crate::error::{Error, Result};
use crate::interceptor::{PreparedRequest, intercept};
use crate::refresh::{RefreshCoordinator, Replay, ReplayTurn, SessionEvent};
use crate::request::{ApiResponse, RequestDescriptor};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::{ReqwestTransport, Transport};

/// Connection settings for `ApiClient::from_config`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, e.g. `https://backoffice.example.com/api`. Request paths and
    /// the `/auth/*` endpoints are joined onto it.
    pub base_url: String,
    /// Per-attempt timeout; an attempt that exceeds it is a NetworkTransient
    /// failure.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// HTTP client shared by the transport and the Token Issuer.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Setup(format!("failed to build HTTP client: {e}")))
    }
}

/// Client for the back-office API. Cheap to clone; clones share the
/// credential store and the refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    issuer: Arc<dyn TokenIssuer>,
    coordinator: Arc<RefreshCoordinator>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        issuer: Arc<dyn TokenIssuer>,
        retry: RetryPolicy,
    ) -> Self {
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), issuer.clone()));
        Self {
            transport,
            store,
            issuer,
            coordinator,
            retry,
        }
    }

    /// Client over HTTP with the issuer at `{base_url}/auth/*`.
    pub fn from_config(config: &ClientConfig, store: Arc<CredentialStore>) -> Result<Self> {
        let http = config.http_client()?;
        let transport = Arc::new(ReqwestTransport::new(http.clone(), config.base_url.clone()));
        let issuer = Arc::new(HttpTokenIssuer::new(http, config.base_url.clone()));
        Ok(Self::new(transport, store, issuer, config.retry))
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Subscribe to `SessionEvent::Ended`, sent when a failed refresh has
    /// cleared the stored credentials.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe()
    }

    /// Exchange username/password for a token pair and store it. Returns the
    /// issuer's user record.
    pub async fn login(&self, username: &str, password: &str) -> Result<serde_json::Value> {
        let outcome = self.issuer.login(username, password).await?;
        self.store.set(outcome.tokens).await?;
        self.coordinator.session_started().await;
        info!(username, "logged in");
        Ok(outcome.user)
    }

    /// Revoke the session server-side and clear local credentials.
    ///
    /// Local credentials are cleared even when the issuer call fails; the
    /// issuer error is still returned.
    pub async fn logout(&self) -> Result<()> {
        let result = match self.store.access_token().await {
            Some(token) => self.issuer.logout(token.expose()).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "server-side logout failed, clearing local session anyway");
        }
        self.store.clear().await?;
        info!("logged out");
        result.map_err(Error::from)
    }

    /// Run one logical request to completion.
    ///
    /// Errors:
    /// - `Terminal`: a non-401 error status, a protocol error, or a 401 on
    ///   the replay after a refresh
    /// - `NetworkPermanent`: no response after the original send and every retry
    /// - `AuthInvalid`: the token refresh failed and the session ended
    #[instrument(
        skip_all,
        fields(request_id = %request.id(), method = %request.method(), path = request.path())
    )]
    pub async fn execute(&self, request: RequestDescriptor) -> Result<ApiResponse> {
        let started = Instant::now();
        let result = self.run(request).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind().label(),
        };
        crate::metrics::record_request(outcome, started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(error = %e, "request failed");
        }
        result
    }

    async fn run(&self, mut request: RequestDescriptor) -> Result<ApiResponse> {
        let mut turn = ReplayTurn::default();
        loop {
            let prepared = intercept(&self.store, request).await;
            let sent = std::mem::take(&mut turn)
                .dispatch(self.transport.send(&prepared))
                .await;
            let failure = match sent {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };
            let PreparedRequest {
                descriptor,
                sent_with,
                ..
            } = prepared;

            match classify(&failure) {
                FailureClass::Unauthorized => {
                    let replay: Replay = self
                        .coordinator
                        .recover(descriptor, sent_with.as_ref())
                        .await?;
                    request = replay.request;
                    turn = replay.turn;
                }
                FailureClass::NetworkTransient => match self.retry.schedule(&descriptor) {
                    RetryDecision::Retry { delay, next } => {
                        crate::metrics::record_retry();
                        warn!(
                            retry = next.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.message(),
                            "no response, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        request = next;
                    }
                    RetryDecision::Exhausted { attempts } => {
                        return Err(Error::NetworkPermanent {
                            attempts,
                            message: failure.message(),
                        });
                    }
                },
                FailureClass::Terminal => return Err(Error::terminal(&failure)),
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.execute(RequestDescriptor::get(path)).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.execute(RequestDescriptor::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.execute(RequestDescriptor::put(path, body)).await
    }

    pub async fn patch(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.execute(RequestDescriptor::patch(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.execute(RequestDescriptor::delete(path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Failure;
    use crate::error::ErrorKind;
    use crate::transport::SendFuture;
    use backoffice_auth::token::IssuerFuture;
    use backoffice_auth::{LoginOutcome, TokenPair};
    use reqwest::header::{AUTHORIZATION, HeaderMap};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    type Responder = dyn Fn(&PreparedRequest, u32) -> std::result::Result<ApiResponse, Failure>
        + Send
        + Sync;

    #[derive(Debug, Clone)]
    struct Sent {
        path: String,
        authorization: Option<String>,
        retried_for_auth: bool,
        at: tokio::time::Instant,
    }

    /// Transport that answers each send from a closure of (request, call index).
    struct ScriptedTransport {
        calls: AtomicU32,
        sent: StdMutex<Vec<Sent>>,
        respond: Box<Responder>,
    }

    impl ScriptedTransport {
        fn new(
            respond: impl Fn(&PreparedRequest, u32) -> std::result::Result<ApiResponse, Failure>
            + Send
            + Sync
            + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                sent: StdMutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn send<'a>(&'a self, request: &'a PreparedRequest) -> SendFuture<'a> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                self.sent.lock().unwrap().push(Sent {
                    path: request.descriptor.path().to_string(),
                    authorization: request
                        .headers
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                    retried_for_auth: request.descriptor.retried_for_auth(),
                    at: tokio::time::Instant::now(),
                });
                (self.respond)(request, n)
            })
        }
    }

    fn ok(body: &str) -> std::result::Result<ApiResponse, Failure> {
        Ok(ApiResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        })
    }

    fn status(code: u16) -> std::result::Result<ApiResponse, Failure> {
        Err(Failure::Status {
            status: code,
            body: String::new(),
        })
    }

    /// 200 for `Bearer T2`, 401 for anything else.
    fn accepts_t2(request: &PreparedRequest, _: u32) -> std::result::Result<ApiResponse, Failure> {
        match request.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some("Bearer T2") => ok(r#"{"orders":[]}"#),
            _ => status(401),
        }
    }

    struct FakeIssuer {
        refreshes: AtomicU32,
        logouts: AtomicU32,
        gate: Option<Notify>,
        refresh_ok: bool,
        logout_ok: bool,
    }

    impl FakeIssuer {
        fn new(refresh_ok: bool, gated: bool) -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicU32::new(0),
                logouts: AtomicU32::new(0),
                gate: gated.then(Notify::new),
                refresh_ok,
                logout_ok: true,
            })
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.notify_one();
            }
        }
    }

    impl TokenIssuer for FakeIssuer {
        fn login<'a>(&'a self, username: &'a str, password: &'a str) -> IssuerFuture<'a, LoginOutcome> {
            Box::pin(async move {
                if username == "alice" && password == "secret" {
                    Ok(LoginOutcome {
                        tokens: TokenPair::new("T1", "R1"),
                        user: serde_json::json!({"username": "alice", "role": "admin"}),
                    })
                } else {
                    Err(backoffice_auth::Error::Rejected("invalid credentials".into()))
                }
            })
        }

        fn refresh<'a>(&'a self, refresh_token: &'a str) -> IssuerFuture<'a, TokenPair> {
            Box::pin(async move {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                if self.refresh_ok && refresh_token == "R1" {
                    Ok(TokenPair::new("T2", "R2"))
                } else {
                    Err(backoffice_auth::Error::Rejected("refresh token expired".into()))
                }
            })
        }

        fn logout<'a>(&'a self, _access_token: &'a str) -> IssuerFuture<'a, ()> {
            Box::pin(async move {
                self.logouts.fetch_add(1, Ordering::SeqCst);
                if self.logout_ok {
                    Ok(())
                } else {
                    Err(backoffice_auth::Error::Http("connection refused".into()))
                }
            })
        }
    }

    fn client(
        transport: Arc<ScriptedTransport>,
        issuer: Arc<FakeIssuer>,
        pair: Option<TokenPair>,
    ) -> ApiClient {
        let store = Arc::new(match pair {
            Some(pair) => CredentialStore::ephemeral_with(pair),
            None => CredentialStore::ephemeral(),
        });
        ApiClient::new(transport, store, issuer, RetryPolicy::default())
    }

    #[tokio::test]
    async fn success_passes_through_with_bearer() {
        let transport = ScriptedTransport::new(|_, _| ok(r#"{"id":7}"#));
        let api = client(
            transport.clone(),
            FakeIssuer::new(true, false),
            Some(TokenPair::new("T1", "R1")),
        );

        let response = api.get("/orders/7").await.unwrap();
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["id"], 7);
        assert_eq!(transport.sent()[0].authorization.as_deref(), Some("Bearer T1"));
    }

    #[tokio::test]
    async fn concurrent_401s_trigger_one_refresh_and_all_succeed() {
        let transport = ScriptedTransport::new(accepts_t2);
        let issuer = FakeIssuer::new(true, true);
        let api = client(transport.clone(), issuer.clone(), Some(TokenPair::new("T1", "R1")));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let api = api.clone();
                tokio::spawn(async move { api.get("/orders").await })
            })
            .collect();

        while api.coordinator().queued().await < 5 {
            tokio::task::yield_now().await;
        }
        issuer.release();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, 200);
        }
        assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls(), 10);

        let replays: Vec<_> = transport
            .sent()
            .into_iter()
            .filter(|s| s.retried_for_auth)
            .collect();
        assert_eq!(replays.len(), 5);
        assert!(replays.iter().all(|s| s.authorization.as_deref() == Some("Bearer T2")));
        assert_eq!(
            api.credentials().access_token().await.unwrap().expose(),
            "T2"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn replays_are_sent_in_queue_order() {
        for _ in 0..20 {
            let transport = ScriptedTransport::new(accepts_t2);
            let issuer = FakeIssuer::new(true, true);
            let api = client(transport.clone(), issuer.clone(), Some(TokenPair::new("T1", "R1")));

            let mut handles = Vec::new();
            for k in 0..8 {
                let caller = api.clone();
                handles.push(tokio::spawn(async move {
                    caller.get(&format!("/orders/{k}")).await
                }));
                // Queue strictly one at a time so the arrival order is known
                while api.coordinator().queued().await < k + 1 {
                    tokio::task::yield_now().await;
                }
            }
            issuer.release();

            for handle in handles {
                assert_eq!(handle.await.unwrap().unwrap().status, 200);
            }
            let replayed: Vec<_> = transport
                .sent()
                .into_iter()
                .filter(|s| s.authorization.as_deref() == Some("Bearer T2"))
                .map(|s| s.path)
                .collect();
            let expected: Vec<_> = (0..8).map(|k| format!("/orders/{k}")).collect();
            assert_eq!(replayed, expected);
        }
    }

    #[tokio::test]
    async fn unauthorized_without_session_ends_it_once() {
        let transport = ScriptedTransport::new(accepts_t2);
        let issuer = FakeIssuer::new(true, false);
        let api = client(transport.clone(), issuer.clone(), None);
        let mut events = api.session_events();

        for _ in 0..2 {
            let err = api.get("/orders").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AuthInvalid);
        }
        assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 0);
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Ended { .. })));
        assert!(events.try_recv().is_err());

        // Logging in starts a new session whose end is reported again
        api.login("alice", "secret").await.unwrap();
        api.credentials().clear().await.unwrap();
        api.get("/orders").await.unwrap_err();
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Ended { .. })));
    }

    #[tokio::test]
    async fn failed_refresh_ends_session_for_every_waiter() {
        let transport = ScriptedTransport::new(accepts_t2);
        let issuer = FakeIssuer::new(false, true);
        let api = client(transport.clone(), issuer.clone(), Some(TokenPair::new("T1", "R1")));
        let mut events = api.session_events();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let api = api.clone();
                tokio::spawn(async move { api.get("/orders").await })
            })
            .collect();

        while api.coordinator().queued().await < 3 {
            tokio::task::yield_now().await;
        }
        issuer.release();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AuthInvalid);
        }
        assert!(!api.credentials().is_logged_in().await);
        assert_eq!(transport.calls(), 3, "no request may be replayed");

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Ended { .. }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_401_after_refresh_is_terminal() {
        let transport = ScriptedTransport::new(|_, _| status(401));
        let issuer = FakeIssuer::new(true, false);
        let api = client(transport.clone(), issuer.clone(), Some(TokenPair::new("T1", "R1")));

        let err = api.get("/orders").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Terminal);
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.calls(), 2);
        assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 1);
        // The refresh itself succeeded, so the session stays
        assert!(api.credentials().is_logged_in().await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_with_linear_backoff_then_succeed() {
        let transport = ScriptedTransport::new(|_, n| {
            if n < 3 {
                Err(Failure::Timeout)
            } else {
                ok("{}")
            }
        });
        let api = client(
            transport.clone(),
            FakeIssuer::new(true, false),
            Some(TokenPair::new("T1", "R1")),
        );

        let response = api.get("/orders").await.unwrap();
        assert_eq!(response.status, 200);

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        let gaps: Vec<_> = sent.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_network_failure_is_permanent_after_three_retries() {
        let transport =
            ScriptedTransport::new(|_, _| Err(Failure::Connect("connection refused".into())));
        let api = client(
            transport.clone(),
            FakeIssuer::new(true, false),
            Some(TokenPair::new("T1", "R1")),
        );

        let err = api.get("/orders").await.unwrap_err();

        match err {
            Error::NetworkPermanent { attempts, message } => {
                assert_eq!(attempts, 4);
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected NetworkPermanent, got {other:?}"),
        }
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn error_statuses_are_not_retried() {
        for code in [400, 403, 404, 500, 503] {
            let transport = ScriptedTransport::new(move |_, _| status(code));
            let issuer = FakeIssuer::new(true, false);
            let api = client(transport.clone(), issuer.clone(), Some(TokenPair::new("T1", "R1")));

            let err = api.get("/orders").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Terminal, "status {code}");
            assert_eq!(err.status(), Some(code));
            assert_eq!(transport.calls(), 1, "status {code}");
            assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_auth_replay_keeps_replay_flag() {
        // 401, refresh, then the replay times out once before succeeding
        let transport = ScriptedTransport::new(|request, n| match n {
            0 => status(401),
            1 => Err(Failure::Timeout),
            _ => accepts_t2(request, n),
        });
        let issuer = FakeIssuer::new(true, false);
        let api = client(transport.clone(), issuer.clone(), Some(TokenPair::new("T1", "R1")));

        api.get("/orders").await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[1].retried_for_auth && sent[2].retried_for_auth);
        assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn login_stores_pair_and_returns_user() {
        let transport = ScriptedTransport::new(|_, _| ok("{}"));
        let api = client(transport, FakeIssuer::new(true, false), None);

        let user = api.login("alice", "secret").await.unwrap();
        assert_eq!(user["role"], "admin");
        let pair = api.credentials().get().await.unwrap();
        assert_eq!(pair.access_token.expose(), "T1");
        assert_eq!(pair.refresh_token.expose(), "R1");

        let err = api.login("alice", "wrong").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Session);
    }

    #[tokio::test]
    async fn logout_clears_even_when_issuer_fails() {
        let transport = ScriptedTransport::new(|_, _| ok("{}"));
        let issuer = Arc::new(FakeIssuer {
            refreshes: AtomicU32::new(0),
            logouts: AtomicU32::new(0),
            gate: None,
            refresh_ok: true,
            logout_ok: false,
        });
        let api = client(transport, issuer.clone(), Some(TokenPair::new("T1", "R1")));

        let err = api.logout().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Session);
        assert_eq!(issuer.logouts.load(Ordering::SeqCst), 1);
        assert!(!api.credentials().is_logged_in().await);
    }

    #[tokio::test]
    async fn logout_without_session_skips_issuer() {
        let transport = ScriptedTransport::new(|_, _| ok("{}"));
        let issuer = FakeIssuer::new(true, false);
        let api = client(transport, issuer.clone(), None);

        api.logout().await.unwrap();
        assert_eq!(issuer.logouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn execute_records_request_outcome() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let transport = ScriptedTransport::new(|_, n| if n == 0 { ok("{}") } else { status(404) });
        let api = client(
            transport,
            FakeIssuer::new(true, false),
            Some(TokenPair::new("T1", "R1")),
        );
        api.get("/orders").await.unwrap();
        api.get("/orders/missing").await.unwrap_err();

        let output = handle.render();
        assert!(output.contains("transport_requests_total{outcome=\"success\"} 1"), "{output}");
        assert!(output.contains("transport_requests_total{outcome=\"terminal\"} 1"), "{output}");
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new("http://localhost:3000/api");
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.http_client().is_ok());
    }
}
