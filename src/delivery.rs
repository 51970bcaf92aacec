//! Authenticated delivery of reports to the ingest endpoint
//!
//! One call to [`IngestClient::deliver`] covers everything that happens to a
//! single report: up to `max_attempts` sequential POSTs, separated by
//! exponentially growing, jittered delays.
//!
//! ## Outcome of an attempt
//!
//! ```text
//! HTTP 200             → accepted, stop
//! HTTP 4xx             → rejected, stop (a bad token will not get better)
//! HTTP 5xx / other     → transient, back off and retry
//! timeout / network    → transient, back off and retry
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::AGENT_VERSION;
use crate::Report;
use crate::config::{AgentConfig, ConfigError, ServerToken};

/// Longest response body excerpt kept for a rejected report.
const MAX_BODY_EXCERPT: usize = 256;

/// Doubling stops after this many failed attempts.
pub const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Bounded exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts per report, including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt, doubled for every further failure
    pub base_delay: Duration,

    /// Add up to half of the delay as random jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let unit = if self.jitter {
            rand::thread_rng().gen_range(0.0..1.0)
        } else {
            0.0
        };
        self.backoff_with(attempt, unit)
    }

    /// Same as [`RetryPolicy::backoff`] with the jitter drawn from `unit` in `[0, 1)`.
    ///
    /// The jitter never exceeds half of the exponential delay, so delays for
    /// consecutive attempts are non-decreasing whatever the random draw. Once
    /// the exponent reaches [`MAX_BACKOFF_EXPONENT`] the delay stays at its
    /// largest jittered value.
    pub fn backoff_with(&self, attempt: u32, unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1);
        if exponent >= MAX_BACKOFF_EXPONENT {
            let delay = self.base_delay.saturating_mul(1 << MAX_BACKOFF_EXPONENT);
            return delay.saturating_add(delay / 2);
        }

        let delay = self.base_delay.saturating_mul(1 << exponent);
        let unit = if unit.is_finite() {
            unit.clamp(0.0, 0.999_999)
        } else {
            0.0
        };
        delay.saturating_add(delay.mul_f64(unit / 2.0))
    }
}

/// Failure of a single attempt that is worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransientError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("unexpected response: HTTP {0}")]
    UnexpectedStatus(u16),
}

/// Terminal failure of a report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The endpoint refused the report (4xx); retrying cannot help
    #[error("ingest endpoint rejected the report with HTTP {status} after {attempts} attempts")]
    Rejected {
        status: u16,
        body: String,
        attempts: u32,
    },

    /// Every attempt failed with a transient error
    #[error("delivery failed after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: TransientError },
}

impl DeliveryError {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Rejected { attempts, .. } | DeliveryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Record of one POST.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    /// 1-based attempt number
    pub attempt: u32,

    /// HTTP status, if a response came back
    pub status: Option<u16>,

    pub latency: Duration,

    pub error: Option<TransientError>,

    /// Delay waited after this attempt before the next one
    pub backoff: Option<Duration>,
}

/// Successful delivery of one report.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub attempts: Vec<DeliveryAttempt>,
}

impl Delivery {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Delays waited between attempts, in order.
    pub fn backoffs(&self) -> Vec<Duration> {
        self.attempts.iter().filter_map(|a| a.backoff).collect()
    }
}

enum AttemptResult {
    Accepted,
    Rejected { status: u16, body: String },
    Transient(TransientError),
}

/// HTTP client for the ingest endpoint.
///
/// Built once at startup and reused for every report.
#[derive(Debug, Clone)]
pub struct IngestClient {
    client: Client,
    url: Url,
    token: ServerToken,
    retry: RetryPolicy,
}

impl IngestClient {
    pub fn new(config: &AgentConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("montime-agent/{AGENT_VERSION}"))
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            client,
            url: config.credential.ingest_url.clone(),
            token: config.credential.token.clone(),
            retry: config.retry,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Delivers one report, retrying transient failures with backoff.
    #[instrument(skip_all, fields(url = %self.url))]
    pub async fn deliver(&self, report: &Report) -> Result<Delivery, DeliveryError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);
        let mut attempt = 1;

        loop {
            let started = Instant::now();
            let result = self.attempt(report).await;
            let latency = started.elapsed();

            let error = match result {
                AttemptResult::Accepted => {
                    trace!(attempt, latency_ms = latency.as_millis() as u64, "report accepted");
                    attempts.push(DeliveryAttempt {
                        attempt,
                        status: Some(StatusCode::OK.as_u16()),
                        latency,
                        error: None,
                        backoff: None,
                    });
                    return Ok(Delivery { attempts });
                }
                AttemptResult::Rejected { status, body } => {
                    debug!(attempt, status, "report rejected, not retrying");
                    return Err(DeliveryError::Rejected {
                        status,
                        body,
                        attempts: attempt,
                    });
                }
                AttemptResult::Transient(error) => error,
            };

            let status = match error {
                TransientError::Server(status) | TransientError::UnexpectedStatus(status) => {
                    Some(status)
                }
                _ => None,
            };

            if attempt == max_attempts {
                return Err(DeliveryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let backoff = self.retry.backoff(attempt);
            debug!(
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                "delivery attempt failed: {error}, retrying"
            );
            attempts.push(DeliveryAttempt {
                attempt,
                status,
                latency,
                error: Some(error),
                backoff: Some(backoff),
            });
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, report: &Report) -> AttemptResult {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(self.token.expose())
            .json(report)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return AttemptResult::Transient(TransientError::Timeout),
            Err(e) => return AttemptResult::Transient(TransientError::Network(e.to_string())),
        };

        let status = response.status();
        if status == StatusCode::OK {
            return AttemptResult::Accepted;
        }

        if status.is_client_error() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_BODY_EXCERPT {
                let mut end = MAX_BODY_EXCERPT;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return AttemptResult::Rejected {
                status: status.as_u16(),
                body,
            };
        }

        if status.is_server_error() {
            AttemptResult::Transient(TransientError::Server(status.as_u16()))
        } else {
            AttemptResult::Transient(TransientError::UnexpectedStatus(status.as_u16()))
        }
    }
}
