//! Outbound HTTP helper shared by all source adapters
//!
//! Every upstream call goes through [`ApiClient`]: a thin wrapper over
//! `reqwest::Client` that owns the per-request timeout and a bounded retry
//! loop. Rate-limit responses (429) honor the server's `Retry-After` hint
//! when present; 5xx and transport errors back off exponentially. Other
//! 4xx responses are permanent and surface immediately.

use crate::config::HttpConfig;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Fallback delay for a 429 without a usable `Retry-After` header.
const RATE_LIMIT_FALLBACK_SECS: u64 = 5;

/// Cap on a server-supplied `Retry-After`, so a hostile hint cannot stall
/// the whole cycle.
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Errors from the outbound HTTP layer
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status {
        status: StatusCode,
        url: String,
        /// Server-supplied retry hint in seconds (429 responses)
        retry_after: Option<u64>,
    },

    #[error("Retries exhausted for {url}: {source}")]
    RetriesExhausted {
        url: String,
        #[source]
        source: Box<HttpError>,
    },
}

impl HttpError {
    /// Transient failures are worth retrying; everything else is permanent.
    fn is_transient(&self) -> bool {
        match self {
            HttpError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            HttpError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            },
            HttpError::RetriesExhausted { .. } => false,
        }
    }
}

/// HTTP client bound to one upstream base URL
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl ApiClient {
    /// Create a client for the given base URL
    pub fn new(base_url: impl Into<String>, http: HttpConfig) -> Result<Self, HttpError> {
        Self::with_default_headers(base_url, http, HeaderMap::new())
    }

    /// Create a client that sends `headers` on every request (used by the
    /// weather adapter, whose upstream mandates a contact-identifying
    /// `User-Agent`)
    pub fn with_default_headers(
        base_url: impl Into<String>,
        http: HttpConfig,
        headers: HeaderMap,
    ) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent("tdp-ingest/0.1")
            .default_headers(headers)
            .build()?;

        Ok(ApiClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: http.max_retries,
        })
    }

    /// Base URL this client is bound to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET a path relative to the base URL and decode the JSON body
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, HttpError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.get_json_url(&url, query).await
    }

    /// GET an absolute URL (upstreams sometimes hand back full URLs, e.g.
    /// the forecast-grid resolution step) and decode the JSON body
    pub async fn get_json_url(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, HttpError> {
        let response = self.get_with_retry(url, query).await?;
        let body = response.json().await?;
        Ok(body)
    }

    /// Issue the GET with bounded retry on transient failures
    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Response, HttpError> {
        let mut last_error: Option<HttpError> = None;

        for attempt in 1..=self.max_retries {
            match self.get_once(url, query).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if !error.is_transient() {
                        return Err(error);
                    }

                    warn!(
                        url,
                        attempt,
                        max_retries = self.max_retries,
                        "transient upstream failure: {error}"
                    );

                    if attempt < self.max_retries {
                        let delay = backoff_delay(&error, attempt);
                        debug!(url, delay_secs = delay.as_secs(), "backing off before retry");
                        tokio::time::sleep(delay).await;
                    }

                    last_error = Some(error);
                },
            }
        }

        // last_error is always set here: the loop only falls through after
        // at least one transient failure.
        let source = last_error.unwrap_or(HttpError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            url: url.to_string(),
            retry_after: None,
        });
        Err(HttpError::RetriesExhausted {
            url: url.to_string(),
            source: Box::new(source),
        })
    }

    async fn get_once(&self, url: &str, query: &[(&str, String)]) -> Result<Response, HttpError> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
            retry_after_secs(&response)
        } else {
            None
        };

        Err(HttpError::Status {
            status,
            url: url.to_string(),
            retry_after,
        })
    }
}

/// Delay before the next attempt: the server hint for rate limits,
/// exponential backoff otherwise
fn backoff_delay(error: &HttpError, attempt: u32) -> Duration {
    if let HttpError::Status {
        status,
        retry_after,
        ..
    } = error
    {
        if *status == StatusCode::TOO_MANY_REQUESTS {
            let hinted = retry_after.unwrap_or(RATE_LIMIT_FALLBACK_SECS);
            return Duration::from_secs(hinted.min(MAX_RETRY_AFTER_SECS));
        }
    }
    Duration::from_secs(2u64.pow(attempt))
}

/// Read a `Retry-After: <seconds>` header, ignoring the HTTP-date form
fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_http_config() -> HttpConfig {
        HttpConfig {
            timeout_secs: 5,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .and(query_param("key", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), test_http_config()).unwrap();
        let body = client
            .get_json("v1/things", &[("key", "abc".to_string())])
            .await
            .unwrap();

        assert_eq!(body["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), test_http_config()).unwrap();
        let error = client.get_json("v1/things", &[]).await.unwrap_err();

        assert!(matches!(
            error,
            HttpError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_server_error_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": 1})))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), test_http_config()).unwrap();
        let body = client.get_json("v1/things", &[]).await.unwrap();

        assert_eq!(body["ok"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/things"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), test_http_config()).unwrap();
        let error = client.get_json("v1/things", &[]).await.unwrap_err();

        assert!(matches!(error, HttpError::RetriesExhausted { .. }));
    }

    #[test]
    fn test_backoff_prefers_server_hint() {
        let rate_limited = HttpError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            url: "http://upstream".to_string(),
            retry_after: Some(12),
        };
        assert_eq!(backoff_delay(&rate_limited, 1), Duration::from_secs(12));

        let server_error = HttpError::Status {
            status: StatusCode::BAD_GATEWAY,
            url: "http://upstream".to_string(),
            retry_after: None,
        };
        assert_eq!(backoff_delay(&server_error, 2), Duration::from_secs(4));
    }
}
