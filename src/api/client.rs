//! Rate-limited identity-search client
//!
//! [`RateLimitedClient`] owns retries and pacing for one API; the HTTP layer
//! sits behind [`HttpTransport`] so it can be swapped out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::limiter::AdaptiveRateLimiter;
use super::types::{CompanyHit, SearchResponse};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::siren::Siren;

/// Largest page the search endpoint serves
pub const MAX_PER_PAGE: u32 = 25;

const ERROR_BODY_CHARS: usize = 200;

/// Raw HTTP response as seen by the retry logic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// `Retry-After` in delta-seconds form, if present
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// Connection-level failure (timeout, refused, reset)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<TransportResponse, TransportError>;
}

pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Setup(e.to_string()))?;
        Ok(Self { http })
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<TransportResponse, TransportError> {
        let response = self
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// GET client with adaptive pacing and bounded retries
pub struct RateLimitedClient {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<AdaptiveRateLimiter>,
    max_rate_limit_retries: u32,
    max_transient_retries: u32,
}

impl RateLimitedClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<AdaptiveRateLimiter>,
        max_rate_limit_retries: u32,
        max_transient_retries: u32,
    ) -> Self {
        Self {
            transport,
            limiter,
            max_rate_limit_retries: max_rate_limit_retries.max(1),
            max_transient_retries: max_transient_retries.max(1),
        }
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    /// Issue a GET, pacing and retrying as needed. Returns the body of the
    /// first successful response.
    pub async fn call(&self, url: &Url) -> Result<String, ApiError> {
        let mut rate_limited = 0u32;
        let mut transient = 0u32;

        loop {
            self.limiter.acquire().await;
            let outcome = self.transport.get(url).await;

            let failure = match outcome {
                Ok(response) if (200..300).contains(&response.status) => {
                    self.limiter.on_success().await;
                    return Ok(response.body);
                }
                Ok(response) if response.status == 429 => {
                    rate_limited += 1;
                    let delay = self.limiter.on_rate_limited(response.retry_after).await;
                    warn!(
                        attempt = rate_limited,
                        delay_ms = delay.as_millis() as u64,
                        retry_after = ?response.retry_after,
                        "Identity API rate limited"
                    );
                    if rate_limited >= self.max_rate_limit_retries {
                        return Err(ApiError::RateLimited {
                            attempts: rate_limited,
                        });
                    }
                    continue;
                }
                Ok(response) if response.status >= 500 || response.status == 408 => {
                    format!("HTTP {}", response.status)
                }
                Ok(response) => {
                    return Err(ApiError::Client {
                        status: response.status,
                        body: response.body.chars().take(ERROR_BODY_CHARS).collect(),
                    });
                }
                Err(e) => e.0,
            };

            transient += 1;
            if transient >= self.max_transient_retries {
                return Err(ApiError::TransientNetwork {
                    attempts: transient,
                    message: failure,
                });
            }
            warn!(attempt = transient, error = %failure, "Identity API call failed, retrying");
        }
    }

    pub async fn call_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, ApiError> {
        let body = self.call(url).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Typed client for the company identity-search API
pub struct IdentityClient {
    client: RateLimitedClient,
    base_url: Url,
}

impl IdentityClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let transport = Arc::new(ReqwestTransport::new(config.timeout)?);
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.base_delay, config.max_delay));
        Self::with_transport(config, transport, limiter)
    }

    /// Build over any transport; the limiter may be shared with other clients.
    pub fn with_transport(
        config: &ApiConfig,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<AdaptiveRateLimiter>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            client: RateLimitedClient::new(
                transport,
                limiter,
                config.max_rate_limit_retries,
                config.max_transient_retries,
            ),
            base_url: Url::parse(&config.base_url)?,
        })
    }

    pub fn client(&self) -> &RateLimitedClient {
        &self.client
    }

    /// Free-text search, passed straight through to the API
    pub async fn search(&self, query: &str, per_page: u32) -> Result<SearchResponse, ApiError> {
        let mut url = self.base_url.join("search")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("per_page", &per_page.clamp(1, MAX_PER_PAGE).to_string());
        debug!(url = %url, "Identity search");
        self.client.call_json(&url).await
    }

    /// The company registered under `siren`, if the API knows it
    pub async fn lookup(&self, siren: Siren) -> Result<Option<CompanyHit>, ApiError> {
        let wanted = siren.to_string();
        let response = self.search(&wanted, 1).await?;
        Ok(response.results.into_iter().find(|hit| hit.siren == wanted))
    }
}
