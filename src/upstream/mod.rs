//! Upstream transport: the trait seam the dispatcher calls through, the
//! reqwest implementation, and the retry wrapper with exponential backoff.

pub mod headers;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classify::{ErrorClassifier, ProviderError};
use crate::config::UpstreamRetryConfig;
use crate::providers::DialectFamily;

pub use headers::HeaderBuilder;

pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
    pub stream: bool,
    pub provider: String,
    pub family: DialectFamily,
    pub cancel: CancellationToken,
}

pub enum UpstreamBody {
    Json(Value),
    Stream(BoxStream<'static, std::result::Result<Bytes, std::io::Error>>),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProviderError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    classifier: ErrorClassifier,
}

impl HttpTransport {
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self {
            client: reqwest::Client::new(),
            classifier,
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProviderError> {
        let call = self
            .client
            .post(&request.url)
            .headers(request.headers.clone())
            .json(&request.body)
            .send();

        let response = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => {
                return Err(ProviderError::cancelled(&request.provider));
            }
            response = call => response.map_err(|err| {
                ProviderError::network(&request.provider, err.to_string())
            })?,
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after_ms = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(self.classifier.classify(
                request.family,
                &request.provider,
                status,
                &body,
                retry_after_ms,
            ));
        }

        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        if request.stream && is_event_stream {
            let byte_stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed();
            return Ok(UpstreamResponse {
                status,
                body: UpstreamBody::Stream(byte_stream),
            });
        }

        let body: Value = response.json().await.map_err(|err| ProviderError {
            code: crate::classify::codes::PROVIDER_RESPONSE_ERROR.to_string(),
            message: format!("invalid upstream JSON: {err}"),
            http_status: 502,
            retryable: true,
            retry_after_ms: None,
            provider: request.provider.clone(),
        })?;
        Ok(UpstreamResponse {
            status,
            body: UpstreamBody::Json(body),
        })
    }
}

/// Retry-After in seconds or HTTP-date; only the seconds form is honored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|seconds| seconds.saturating_mul(1_000))
}

/// Retry loop around an upstream call. The operation closure rebuilds the
/// request (and re-signs headers) on every attempt. Non-retryable errors and
/// cancellations short-circuit.
pub async fn with_retry<T, F, Fut>(
    config: &UpstreamRetryConfig,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.retryable || err.is_cancelled() || attempt >= config.max_attempts {
                    return Err(err);
                }
                let delay = (config.base_delay_ms as f64
                    * config.multiplier.powi(attempt.saturating_sub(1) as i32))
                    as u64;
                let delay = delay.min(config.max_delay_ms);
                debug!(
                    provider = %err.provider,
                    code = %err.code,
                    attempt,
                    delay_ms = delay,
                    "retrying upstream call"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::codes;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry_config(max_attempts: u32) -> UpstreamRetryConfig {
        UpstreamRetryConfig {
            max_attempts,
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
        }
    }

    fn retryable(provider: &str) -> ProviderError {
        ProviderError {
            code: codes::NETWORK_ERROR.to_string(),
            message: "boom".to_string(),
            http_status: 502,
            retryable: true,
            retry_after_ms: None,
            provider: provider.to_string(),
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&retry_config(3), move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(retryable("p"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&retry_config(5), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError {
                    retryable: false,
                    ..retryable("p")
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_then_surfaces() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&retry_config(3), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(retryable("p"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(7_000));

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }
}
