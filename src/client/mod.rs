//! Resilient brokerage API client.
//!
//! Every outbound call goes through [`ApiClient::call`], which attaches the
//! current bearer token and applies one retry policy:
//!
//! | Outcome                 | Handling                                         |
//! |-------------------------|--------------------------------------------------|
//! | 2xx                     | returned                                         |
//! | timeout / connect / 5xx | exponential backoff, up to `max_attempts`        |
//! | 429                     | sleep `Retry-After` (default 60 s), one retry    |
//! | other 4xx               | [`ApiError::Rejected`], never retried            |
//! | builder / redirect      | [`ApiError::InvalidRequest`], never retried      |
//!
//! Retries reuse the token fetched at the start of the sequence. Only when a
//! sequence has run longer than `revalidate_after` is the token re-validated,
//! once, before the final attempt.

mod retry;

pub use retry::RetryPolicy;

use crate::error::ApiError;
use crate::token::{TokenManager, TokenSet};
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A brokerage API request, rebuilt for every attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).json(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(ApiError::Decode)
    }
}

/// Result of a single attempt.
enum Attempt {
    Success(ApiResponse),
    RateLimited(Duration),
    Transient(String),
    Rejected { status: u16, body: String },
    Invalid(reqwest::Error),
}

/// Bearer-authenticated client with timeout, backoff and rate-limit handling.
pub struct ApiClient {
    http_client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
}

impl ApiClient {
    /// # Arguments
    /// * `http_client` - Shared HTTP client
    /// * `base_url` - Brokerage API root (e.g. `https://api.schwabapi.com`)
    /// * `tokens` - Source of the bearer token
    /// * `policy` - Retry budget and delays
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `request`, retrying transient failures.
    ///
    /// Fails with [`ApiError::Unauthenticated`] before any network call when
    /// no usable token exists.
    pub async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut token = self.bearer_token().await?;
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts;
        let mut rate_limit_retry_used = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if attempt == max_attempts
                && attempt > 1
                && started.elapsed() >= self.policy.revalidate_after
            {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Retry sequence exceeded wall-clock ceiling, re-validating token"
                );
                token = self.bearer_token().await?;
            }

            let reason = match self.send_once(request, &token).await {
                Attempt::Success(response) => {
                    if attempt > 1 {
                        info!(
                            method = %request.method,
                            path = %request.path,
                            attempt = attempt,
                            "Request succeeded after retry"
                        );
                    }
                    return Ok(response);
                }
                Attempt::Rejected { status, body } => {
                    warn!(
                        method = %request.method,
                        path = %request.path,
                        status = status,
                        "Request rejected"
                    );
                    return Err(ApiError::Rejected { status, body });
                }
                Attempt::Invalid(e) => {
                    warn!(
                        method = %request.method,
                        path = %request.path,
                        error = %e,
                        "Request could not be sent"
                    );
                    return Err(ApiError::InvalidRequest(e));
                }
                Attempt::RateLimited(wait) => {
                    if rate_limit_retry_used || attempt >= max_attempts {
                        return Err(ApiError::Unavailable {
                            attempts: attempt,
                            reason: "rate limited (429)".to_string(),
                        });
                    }
                    rate_limit_retry_used = true;
                    warn!(
                        method = %request.method,
                        path = %request.path,
                        attempt = attempt,
                        retry_after_secs = wait.as_secs(),
                        "Rate limit exceeded, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Attempt::Transient(reason) => reason,
            };

            if attempt >= max_attempts {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    attempts = attempt,
                    error = %reason,
                    "Retry budget exhausted"
                );
                return Err(ApiError::Unavailable {
                    attempts: attempt,
                    reason,
                });
            }

            let delay = self.policy.backoff_delay(attempt);
            warn!(
                method = %request.method,
                path = %request.path,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Request failed, backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// [`call`](Self::call) and decode the body as JSON.
    pub async fn call_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        self.call(request).await?.json()
    }

    async fn bearer_token(&self) -> Result<TokenSet, ApiError> {
        self.tokens
            .ensure_valid_token()
            .await?
            .ok_or(ApiError::Unauthenticated)
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn send_once(&self, request: &ApiRequest, token: &TokenSet) -> Attempt {
        let mut builder = self
            .http_client
            .request(request.method.clone(), self.url_for(&request.path))
            .bearer_auth(&token.access_token)
            .header(ACCEPT, "application/json")
            .timeout(self.policy.request_timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() || e.is_redirect() => return Attempt::Invalid(e),
            Err(e) if e.is_timeout() => return Attempt::Transient(format!("timed out: {}", e)),
            Err(e) if e.is_connect() => return Attempt::Transient(format!("connection failed: {}", e)),
            Err(e) => return Attempt::Transient(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::RateLimited(self.policy.retry_after_delay(response.headers()));
        }
        if status.is_server_error() {
            return Attempt::Transient(format!("server error {}", status));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Attempt::Transient(format!("failed to read body: {}", e)),
        };

        if status.is_success() {
            Attempt::Success(ApiResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            Attempt::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("/trader/v1/accounts").query("fields", "positions");
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.path(), "/trader/v1/accounts");
        assert_eq!(
            request.query,
            vec![("fields".to_string(), "positions".to_string())]
        );
        assert!(request.body.is_none());

        let order = ApiRequest::post("/orders", serde_json::json!({"qty": 1}));
        assert_eq!(order.method(), &Method::POST);
        assert!(order.body.is_some());
    }

    #[test]
    fn test_response_json_decode_error() {
        let response = ApiResponse {
            status: 200,
            body: "not json".to_string(),
        };
        let result: Result<Value, ApiError> = response.json();
        assert!(matches!(result, Err(ApiError::Decode(_))));
    }
}
