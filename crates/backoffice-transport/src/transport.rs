//! Wire transport abstraction
//!
//! `Transport` sends one prepared attempt and reports either a 2xx response
//! or a `Failure`. It does no retrying and no auth handling; the client
//! pipeline owns both. The seam lets tests script exact failure sequences.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::classify::Failure;
use crate::interceptor::PreparedRequest;
use crate::request::ApiResponse;

/// Boxed future returned by `Transport::send`.
pub type SendFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<ApiResponse, Failure>> + Send + 'a>>;

/// Sends a single attempt.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a PreparedRequest) -> SendFuture<'a>;
}

/// `Transport` over a shared `reqwest::Client`.
///
/// The per-request timeout comes from the client (`ClientConfig::http_client`),
/// so it applies the same way to business calls and the refresh call.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Join the base URL and a request path.
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    async fn send_inner(
        &self,
        request: &PreparedRequest,
    ) -> std::result::Result<ApiResponse, Failure> {
        let descriptor = &request.descriptor;
        let url = self.url_for(descriptor.path());

        let mut builder = self
            .client
            .request(descriptor.method().clone(), &url)
            .headers(request.headers.clone());
        if !descriptor.query().is_empty() {
            builder = builder.query(descriptor.query());
        }
        if let Some(body) = descriptor.body() {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Failure::from_reqwest(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Failure::from_reqwest(&e))?;

        debug!(
            request_id = descriptor.id(),
            status = status.as_u16(),
            bytes = body.len(),
            "response received"
        );

        if !status.is_success() {
            return Err(Failure::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(ApiResponse {
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a PreparedRequest) -> SendFuture<'a> {
        Box::pin(self.send_inner(request))
    }
}
