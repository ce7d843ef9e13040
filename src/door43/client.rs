//! Blocking HTTP client for the Door43 API with retries for transient failures.

use std::time::Duration;
use tracing::warn;

const DEFAULT_USER_AGENT: &str = concat!("door43-preview/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;

/// Default number of attempts (initial plus retries).
const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default backoff in seconds after each failed attempt.
const DEFAULT_BACKOFF_SECS: [u64; 2] = [1, 2];
/// Backoff for HTTP 429 (rate limit): wait longer so the server can recover.
const BACKOFF_429_SECS: [u64; 4] = [30, 60, 90, 120];

/// Blocking HTTP client that retries timeouts, connection errors, 5xx and 429.
#[derive(Debug)]
pub struct ApiClient {
    inner: reqwest::blocking::Client,
    retry_count: u32,
    backoff_secs: Vec<u64>,
}

impl ApiClient {
    /// Client with default User-Agent, timeout and retry schedule.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::builder().build()
    }

    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    /// GET with retries. Non-retryable errors and 4xx other than 429 are returned at once.
    /// After the last attempt the final response (even a 5xx) or error is returned.
    pub fn get_with_retry(
        &self,
        url: &str,
    ) -> Result<reqwest::blocking::Response, reqwest::Error> {
        let max_attempts = self.retry_count.max(1);
        let mut attempt = 0;
        loop {
            let last_attempt = attempt + 1 >= max_attempts;
            let result = self
                .inner
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send();
            let backoff = match &result {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 {
                        Some(backoff_at(&BACKOFF_429_SECS, attempt, 60))
                    } else if status.is_server_error() {
                        Some(backoff_at(&self.backoff_secs, attempt, 1))
                    } else {
                        None
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    Some(backoff_at(&self.backoff_secs, attempt, 1))
                }
                Err(_) => None,
            };
            match backoff {
                Some(secs) if !last_attempt => {
                    warn!(
                        url,
                        attempt = attempt + 1,
                        max_attempts,
                        backoff_secs = secs,
                        "transient HTTP failure, retrying"
                    );
                    std::thread::sleep(Duration::from_secs(secs));
                    attempt += 1;
                }
                _ => return result,
            }
        }
    }
}

/// Backoff for the given zero-based attempt; the last entry is reused past the end.
fn backoff_at(schedule: &[u64], attempt: u32, fallback: u64) -> u64 {
    schedule
        .get(attempt as usize)
        .or_else(|| schedule.last())
        .copied()
        .unwrap_or(fallback)
}

/// Builder for [ApiClient].
#[derive(Debug)]
pub struct ApiClientBuilder {
    user_agent: Option<String>,
    timeout_secs: u64,
    retry_count: u32,
    retry_backoff_secs: Vec<u64>,
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
        }
    }
}

impl ApiClientBuilder {
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Request timeout in seconds. Default 30.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Number of attempts for transient failures (default 3, minimum 1).
    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = n.max(1);
        self
    }

    /// Backoff delays in seconds before each retry. If shorter than retry_count - 1,
    /// the last value is reused; if empty, doubling from 1s is used.
    pub fn retry_backoff_secs(mut self, secs: Vec<u64>) -> Self {
        self.retry_backoff_secs = secs;
        self
    }

    pub fn build(self) -> Result<ApiClient, reqwest::Error> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let inner = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(self.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        let backoff_secs = if self.retry_backoff_secs.is_empty() {
            let n = self.retry_count.saturating_sub(1) as usize;
            (0..n).map(|i| 1u64 << i.min(4)).collect::<Vec<_>>()
        } else {
            self.retry_backoff_secs
        };
        Ok(ApiClient {
            inner,
            retry_count: self.retry_count,
            backoff_secs,
        })
    }
}
