//! Shared HTTP plumbing for catalog providers
//!
//! Both provider flavours issue plain `GET`s, retry throttling and server
//! failures with exponential backoff, and translate final statuses into
//! [`CatalogError`] values.

use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CatalogError, Result};

/// Per-request timeout when none is configured
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("shelf-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct CatalogClient {
    http_client: Arc<dyn HttpClient>,
    retry_policy: RetryPolicy,
    request_timeout: Duration,
}

impl CatalogClient {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            http_client,
            retry_policy: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// GET `url`, retrying 429/5xx answers and transport failures.
    ///
    /// Returns the first 2xx response. 404 becomes [`CatalogError::NotFound`],
    /// a 429 that survives every attempt becomes [`CatalogError::RateLimited`]
    /// carrying the last `Retry-After`, and other statuses become
    /// [`CatalogError::ApiError`].
    pub async fn get(&self, url: &str, accept: &str) -> Result<HttpResponse> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request = HttpRequest::get(url)
                .accept(accept)
                .header("User-Agent", USER_AGENT)
                .timeout(self.request_timeout);

            let failure = match self.http_client.execute(request).await {
                Ok(response) if response.is_success() => {
                    debug!("Catalog request succeeded: status={}", response.status);
                    return Ok(response);
                }
                Ok(response) if response.status == 404 => {
                    return Err(CatalogError::NotFound {
                        url: url.to_string(),
                    });
                }
                Ok(response) if response.status == 429 => CatalogError::RateLimited {
                    retry_after: response.retry_after(),
                },
                Ok(response) if response.is_server_error() => CatalogError::ApiError {
                    status_code: response.status,
                    message: String::from_utf8_lossy(&response.body).to_string(),
                },
                Ok(response) => {
                    // Client errors other than 404/429 are not retried
                    warn!("Catalog request failed: status={}", response.status);
                    return Err(CatalogError::ApiError {
                        status_code: response.status,
                        message: String::from_utf8_lossy(&response.body).to_string(),
                    });
                }
                Err(e) if e.is_transport() => CatalogError::NetworkError(e.to_string()),
                Err(e) => return Err(e.into()),
            };

            if attempt >= max_attempts {
                warn!(
                    "Catalog request failed after {} attempts: {}",
                    attempt, failure
                );
                return Err(failure);
            }

            let mut backoff = self.retry_policy.delay_for(attempt);
            if let CatalogError::RateLimited {
                retry_after: Some(wait),
            } = &failure
            {
                backoff = backoff.max(*wait).min(self.retry_policy.max_delay);
            }
            warn!(
                "Catalog request failed (attempt {}/{}): {}, retrying in {:?}",
                attempt, max_attempts, failure, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// GET `url` and return the body as text.
    pub async fn get_text(&self, url: &str, accept: &str) -> Result<String> {
        let response = self.get(url, accept).await?;
        response
            .text()
            .map_err(|e| CatalogError::ParseError(format!("Invalid body from {}: {}", url, e)))
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.get(url, "application/json").await?;
        serde_json::from_slice(&response.body).map_err(|e| {
            CatalogError::ParseError(format!("Failed to decode response from {}: {}", url, e))
        })
    }
}

/// Resolve `key` against `base_url`. Absolute URLs pass through untouched.
pub fn resolve_url(base_url: &str, key: &str) -> String {
    if key.starts_with("http://") || key.starts_with("https://") {
        return key.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

/// Fill `{name}` placeholders in a URL template. Values are URL-encoded
/// except for `{base}` and `{key}` paths.
pub fn expand_template(template: &str, base_url: &str, vars: &[(&str, &str)]) -> String {
    let mut url = template.replace("{base}", base_url.trim_end_matches('/'));
    for (name, value) in vars {
        let placeholder = format!("{{{}}}", name);
        let encoded = if *name == "key" {
            value.trim_start_matches('/').to_string()
        } else {
            urlencoding::encode(value).into_owned()
        };
        url = url.replace(&placeholder, &encoded);
    }
    url
}
