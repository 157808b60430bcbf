use futures_util::future::join_all;
use futures_util::StreamExt;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::helpers::retry_delay;
use crate::network::NetworkConfig;
use crate::validate::ValidatedReference;

// ============================================================================
// Content Fetcher
// ============================================================================

/// Largest response body accepted for one reference (10 MB).
pub(crate) const MAX_SCRIPT_SIZE: usize = 10 * 1024 * 1024;

/// Default cap on in-flight fetches across a whole analysis tree.
pub(crate) const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 8;

/// Why a reference could not be retrieved. Recorded, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FetchError {
    Status { code: u16, reason: String },
    Timeout { seconds: u64 },
    Transport(String),
    TooLarge { limit: usize },
}

impl FetchError {
    /// Client errors and oversize bodies will not improve on retry.
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { code, .. } => *code >= 500,
            FetchError::Timeout { .. } | FetchError::Transport(_) => true,
            FetchError::TooLarge { .. } => false,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status { code, reason } if reason.is_empty() => write!(f, "HTTP {}", code),
            FetchError::Status { code, reason } => write!(f, "HTTP {} {}", code, reason),
            FetchError::Timeout { seconds } => write!(f, "timed out after {}s", seconds),
            FetchError::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchError::TooLarge { limit } => write!(
                f,
                "response too large (max {:.0} MB)",
                *limit as f64 / 1_048_576.0
            ),
        }
    }
}

/// Successfully retrieved body plus its lowercase hex SHA-256.
#[derive(Debug, Clone)]
pub(crate) struct FetchedScript {
    pub(crate) content: String,
    pub(crate) digest: String,
    pub(crate) size: usize,
}

impl FetchedScript {
    pub(crate) fn from_bytes(body: &[u8]) -> Self {
        Self {
            content: String::from_utf8_lossy(body).into_owned(),
            digest: sha256_hex(body),
            size: body.len(),
        }
    }
}

/// Result of retrieving one validated reference. Exactly one of content or
/// error by construction.
#[derive(Debug, Clone)]
pub(crate) struct FetchOutcome {
    pub(crate) url: String,
    pub(crate) result: Result<FetchedScript, FetchError>,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// HTTP(S) retriever shared by every branch of one analysis. Cloning shares
/// the connection pool and the in-flight permit pool.
#[derive(Debug, Clone)]
pub(crate) struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    retries: usize,
    max_size: usize,
    permits: Arc<Semaphore>,
}

impl Fetcher {
    pub(crate) fn new(net_config: &NetworkConfig, max_concurrent: usize) -> Self {
        Self {
            client: net_config.script_client.clone(),
            timeout: net_config.timeout,
            retries: net_config.retries.max(1),
            max_size: MAX_SCRIPT_SIZE,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Fetch every distinct reference concurrently. Outcomes come back sorted
    /// by URL regardless of completion order.
    pub(crate) async fn fetch_all<I>(&self, references: I) -> Vec<FetchOutcome>
    where
        I: IntoIterator<Item = ValidatedReference>,
    {
        let unique: BTreeSet<ValidatedReference> = references.into_iter().collect();
        tracing::debug!(count = unique.len(), "fetching references");
        join_all(unique.iter().map(|r| self.fetch_one(r))).await
    }

    /// Fetch one reference with retries. Never fails; errors are recorded in
    /// the outcome.
    pub(crate) async fn fetch_one(&self, reference: &ValidatedReference) -> FetchOutcome {
        let url = reference.url();
        let mut last_error = FetchError::Transport("no attempt made".to_string());

        for attempt in 1..=self.retries {
            if attempt > 1 {
                tokio::time::sleep(retry_delay(attempt)).await;
                tracing::debug!(url = %url, attempt, "retrying fetch");
            }

            let result = match self.permits.acquire().await {
                Ok(_permit) => match tokio::time::timeout(self.timeout, self.attempt(url)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout {
                        seconds: self.timeout.as_secs(),
                    }),
                },
                Err(_) => Err(FetchError::Transport("fetch pool closed".to_string())),
            };

            match result {
                Ok(body) => {
                    let fetched = FetchedScript::from_bytes(&body);
                    tracing::debug!(url = %url, bytes = fetched.size, digest = %fetched.digest, "fetched");
                    return FetchOutcome {
                        url: reference.to_string(),
                        result: Ok(fetched),
                    };
                }
                Err(e) => {
                    let retry = e.is_retryable();
                    last_error = e;
                    if !retry {
                        break;
                    }
                }
            }
        }

        tracing::warn!(url = %url, error = %last_error, "fetch failed");
        FetchOutcome {
            url: reference.to_string(),
            result: Err(last_error),
        }
    }

    async fn attempt(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_size as u64 {
                return Err(FetchError::TooLarge {
                    limit: self.max_size,
                });
            }
        }

        // Stream with a size cap; Content-Length can lie
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| self.classify_reqwest_error(&e))?;
            if body.len() + bytes.len() > self.max_size {
                return Err(FetchError::TooLarge {
                    limit: self.max_size,
                });
            }
            body.extend_from_slice(&bytes);
        }

        Ok(body)
    }

    fn classify_reqwest_error(&self, e: &reqwest::Error) -> FetchError {
        if e.is_timeout() {
            return FetchError::Timeout {
                seconds: self.timeout.as_secs(),
            };
        }
        FetchError::Transport(error_chain(e))
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}
