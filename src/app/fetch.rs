use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};
use url::Url;

use super::config::FetchSettings;
use super::error::{FetchError, RetryExhausted};

/// A single GET attempt. Implementations must not retry on their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, FetchError>;
}

/// reqwest-backed fetcher. Any status below 500 is a usable response.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self, FetchError> {
        let timeout = settings.timeout();
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(8))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let res = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let status = res.status();
        if status.is_server_error() {
            return Err(FetchError::ServerStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            debug!(url, status = status.as_u16(), "non-success response kept as data");
        }

        res.text().await.map_err(|e| {
            if e.is_timeout() {
                self.classify(url, e)
            } else {
                FetchError::Body {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }
}

/// Backoff parameters. The delay before retry `n` (1-based count of failures so far)
/// is `base_delay * 2^n` plus a uniform jitter below `max_jitter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&FetchSettings::default())
    }
}

impl From<&FetchSettings> for RetryPolicy {
    fn from(settings: &FetchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_jitter: Duration::from_millis(settings.max_jitter_ms),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, failures: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let exponential = base_ms.saturating_mul(2_u64.saturating_pow(failures));
        let jitter_cap = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_cap)
        };
        Duration::from_millis(exponential.saturating_add(jitter))
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Runs `attempt` until it succeeds or `policy.max_attempts` calls have failed.
///
/// `attempt` receives the 1-based attempt number. There is no sleep after the last
/// failure.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut attempt: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures = 0u32;
    loop {
        match attempt(failures + 1).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failures += 1;
                if failures >= max_attempts {
                    return Err(RetryExhausted {
                        attempts: failures,
                        last: err,
                    });
                }
                let delay = policy.backoff(failures);
                debug!(attempt = failures, ?delay, error = %err, "retrying");
                sleeper.sleep(delay).await;
            }
        }
    }
}

/// The fetcher the pipeline talks to: never errors, logs and yields `None` instead.
#[derive(Clone)]
pub struct RetryingFetcher {
    inner: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryingFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn fetch(&self, url: &str) -> Option<String> {
        match self.fetch_detailed(url).await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(url, attempts = err.attempts, error = %err.last, "fetch failed");
                None
            }
        }
    }

    pub async fn fetch_detailed(&self, url: &str) -> Result<String, RetryExhausted<FetchError>> {
        // Malformed URLs cannot succeed on a later attempt.
        if Url::parse(url).is_err() {
            return Err(RetryExhausted {
                attempts: 1,
                last: FetchError::InvalidUrl(url.to_string()),
            });
        }
        let inner = Arc::clone(&self.inner);
        retry_with_backoff(&self.policy, self.sleeper.as_ref(), |_| {
            let inner = Arc::clone(&inner);
            let url = url.to_string();
            async move { inner.get(&url).await }
        })
        .await
    }
}
