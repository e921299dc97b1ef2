//! Rate-limit detection and exponential backoff.
//!
//! Agent and judge processes are opaque executables, so a transient quota
//! signal can only be recognised from their output. Backoff state is kept
//! separately per [`RateLimitSource`]: an agent hitting its quota never
//! delays judge invocations, and vice versa. Within one source, every worker
//! honours the shared `blocked_until` deadline so a burst of parallel runs
//! does not hammer an exhausted API.

use std::fmt;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ConfigError, RateLimitError};
use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;

/// Which external collaborator produced a rate-limit signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitSource {
    Agent,
    Judge,
}

impl RateLimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitSource::Agent => "agent",
            RateLimitSource::Judge => "judge",
        }
    }
}

impl fmt::Display for RateLimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a transient-quota episode, attached to the affected run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub source: RateLimitSource,
    /// Number of retries performed (not counting the first attempt).
    pub retry_count: u32,
    /// Delays actually slept, in seconds, in order.
    pub backoff_schedule_secs: Vec<f64>,
    /// Output line that triggered the most recent detection.
    pub last_signal: String,
    pub detected_at: DateTime<Utc>,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_secs: f64,
    pub multiplier: f64,
    pub max_secs: f64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_secs: 5.0,
            multiplier: 2.0,
            max_secs: 300.0,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.initial_secs * exp).min(self.max_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// The full delay schedule if every retry is used.
    pub fn schedule(&self) -> Vec<f64> {
        (0..self.max_retries)
            .map(|attempt| self.delay_for(attempt).as_secs_f64())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.initial_secs.is_finite() || self.initial_secs < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.initial_secs must be a non-negative number".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.multiplier must be at least 1.0".to_string(),
            ));
        }
        if !self.max_secs.is_finite() || self.max_secs < self.initial_secs {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.max_secs must be >= initial_secs".to_string(),
            ));
        }
        Ok(())
    }
}

/// A bare `429` is only a signal next to an HTTP status marker; line
/// numbers in stack traces and compiler diagnostics are not.
const RATE_LIMIT_PATTERN: &str = r"(?i)\b(?:http(?:/\d(?:\.\d)?)?|status(?:[ _]?code)?|error|code)\W{0,3}429\b|rate[ _-]?limit|overloaded|quota exceeded|too many requests";

static RATE_LIMIT_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Returns the first output line carrying a rate-limit signal.
pub fn detect_rate_limit(text: &str) -> Option<String> {
    let re = RATE_LIMIT_RE
        .get_or_init(|| Regex::new(RATE_LIMIT_PATTERN).ok())
        .as_ref()?;
    text.lines()
        .find(|line| re.is_match(line))
        .map(|line| crate::utils::truncate(line.trim(), 200))
}

/// Result of one attempt handed to [`RateLimitTracker::retry_rate_limited`].
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    RateLimited(String),
}

/// Successful value plus the rate-limit episode it survived, if any.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub rate_limit: Option<RateLimitInfo>,
}

#[derive(Debug, Default)]
struct SourceState {
    consecutive_hits: u32,
    total_retries: u64,
    blocked_until: Option<Instant>,
}

/// Snapshot of one source's backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub consecutive_hits: u32,
    pub total_retries: u64,
    pub blocked: bool,
}

/// Per-source backoff coordinator shared by all workers.
#[derive(Debug)]
pub struct RateLimitTracker {
    policy: BackoffPolicy,
    agent: Mutex<SourceState>,
    judge: Mutex<SourceState>,
    metrics: MetricsCollector,
}

impl RateLimitTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            agent: Mutex::new(SourceState::default()),
            judge: Mutex::new(SourceState::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn state(&self, source: RateLimitSource) -> &Mutex<SourceState> {
        match source {
            RateLimitSource::Agent => &self.agent,
            RateLimitSource::Judge => &self.judge,
        }
    }

    /// Sleeps until the source's shared backoff deadline has passed.
    pub async fn wait_until_clear(&self, source: RateLimitSource) {
        loop {
            let deadline = self.state(source).lock().await.blocked_until;
            match deadline {
                Some(until) if until > Instant::now() => tokio::time::sleep_until(until).await,
                _ => return,
            }
        }
    }

    async fn record_hit(&self, source: RateLimitSource, delay: Duration) {
        let mut state = self.state(source).lock().await;
        state.consecutive_hits += 1;
        state.total_retries += 1;
        let until = Instant::now() + delay;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    async fn record_success(&self, source: RateLimitSource) {
        self.state(source).lock().await.consecutive_hits = 0;
    }

    pub async fn stats(&self, source: RateLimitSource) -> SourceStats {
        let state = self.state(source).lock().await;
        SourceStats {
            consecutive_hits: state.consecutive_hits,
            total_retries: state.total_retries,
            blocked: state.blocked_until.is_some_and(|until| until > Instant::now()),
        }
    }

    /// Runs `op` until it stops reporting a rate limit or retries run out.
    ///
    /// Exhaustion is an error carrying the full [`RateLimitInfo`]; it is never
    /// converted into a normal outcome.
    pub async fn retry_rate_limited<T, F, Fut>(
        &self,
        source: RateLimitSource,
        cancel: &Shutdown,
        mut op: F,
    ) -> Result<Retried<T>, RateLimitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut schedule = Vec::new();
        let mut last_signal = String::new();
        let mut attempt = 0u32;

        loop {
            tokio::select! {
                _ = self.wait_until_clear(source) => {}
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
            }

            let signal = match op().await {
                Attempt::Done(value) => {
                    self.record_success(source).await;
                    let rate_limit = (attempt > 0).then(|| RateLimitInfo {
                        source,
                        retry_count: attempt,
                        backoff_schedule_secs: schedule,
                        last_signal,
                        detected_at: Utc::now(),
                    });
                    return Ok(Retried { value, rate_limit });
                }
                Attempt::RateLimited(signal) => signal,
            };

            if attempt >= self.policy.max_retries {
                warn!(
                    source = %source,
                    retries = attempt,
                    signal = %signal,
                    "Rate limit retries exhausted"
                );
                return Err(RateLimitError::Exhausted(RateLimitInfo {
                    source,
                    retry_count: attempt,
                    backoff_schedule_secs: schedule,
                    last_signal: signal,
                    detected_at: Utc::now(),
                }));
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                source = %source,
                attempt = attempt + 1,
                delay_secs = delay.as_secs_f64(),
                signal = %signal,
                "Rate limited, backing off"
            );
            self.metrics.record_rate_limit_retry(source.as_str());
            self.record_hit(source, delay).await;
            schedule.push(delay.as_secs_f64());
            last_signal = signal;
            attempt += 1;
            debug!(source = %source, "Backoff deadline recorded");
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_secs: 0.01,
            multiplier: 2.0,
            max_secs: 0.05,
            max_retries,
        }
    }

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.schedule(), vec![5.0, 10.0, 20.0, 40.0, 80.0]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
    }

    #[test]
    fn test_detect_rate_limit() {
        assert!(detect_rate_limit("Error: 429 Too Many Requests").is_some());
        assert!(detect_rate_limit("{\"type\":\"rate_limit_error\"}").is_some());
        assert!(detect_rate_limit("API is Overloaded, try later").is_some());
        assert!(detect_rate_limit("monthly quota exceeded").is_some());
        assert!(detect_rate_limit("test result: ok. 4290 passed").is_none());
        assert!(detect_rate_limit("all good").is_none());
    }

    #[test]
    fn test_detect_429_needs_status_context() {
        assert!(detect_rate_limit("HTTP/1.1 429").is_some());
        assert!(detect_rate_limit("{\"status\": 429}").is_some());
        assert!(detect_rate_limit("upstream returned status code 429").is_some());
        assert!(detect_rate_limit("Error code: 429").is_some());

        assert!(detect_rate_limit("  File \"judge.py\", line 429, in main").is_none());
        assert!(detect_rate_limit("error[E0308]: mismatched types\n  --> src/parser.rs:429:13").is_none());
        assert!(detect_rate_limit("src/a.rs:429:13: warning: unused variable").is_none());
        assert!(detect_rate_limit("429 tests collected").is_none());
    }

    #[test]
    fn test_detect_returns_signal_line() {
        let out = "starting\nHTTP 429 from upstream\ndone";
        assert_eq!(detect_rate_limit(out).as_deref(), Some("HTTP 429 from upstream"));
    }

    #[test]
    fn test_policy_validation() {
        assert!(BackoffPolicy::default().validate().is_ok());
        let bad = BackoffPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let tracker = RateLimitTracker::new(fast_policy(5));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = tracker
            .retry_rate_limited(RateLimitSource::Judge, &Shutdown::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Attempt::RateLimited("429".to_string())
                } else {
                    Attempt::Done(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 42);
        let info = result.rate_limit.unwrap();
        assert_eq!(info.retry_count, 2);
        assert_eq!(info.backoff_schedule_secs.len(), 2);
        assert_eq!(info.source, RateLimitSource::Judge);
    }

    #[tokio::test]
    async fn test_no_info_without_rate_limit() {
        let tracker = RateLimitTracker::new(fast_policy(5));
        let result = tracker
            .retry_rate_limited(RateLimitSource::Agent, &Shutdown::new(), || async {
                Attempt::Done("ok")
            })
            .await
            .unwrap();
        assert!(result.rate_limit.is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_is_an_error() {
        let tracker = RateLimitTracker::new(fast_policy(2));
        let err = tracker
            .retry_rate_limited(RateLimitSource::Agent, &Shutdown::new(), || async {
                Attempt::<()>::RateLimited("rate limit".to_string())
            })
            .await
            .unwrap_err();

        match err {
            RateLimitError::Exhausted(info) => {
                assert_eq!(info.retry_count, 2);
                assert_eq!(info.source, RateLimitSource::Agent);
                assert_eq!(info.last_signal, "rate limit");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tracker.stats(RateLimitSource::Agent).await.total_retries, 2);
    }

    #[tokio::test]
    async fn test_sources_are_independent() {
        let tracker = Arc::new(RateLimitTracker::new(BackoffPolicy {
            initial_secs: 30.0,
            multiplier: 2.0,
            max_secs: 60.0,
            max_retries: 1,
        }));

        // Block the agent source for 30s.
        tracker
            .record_hit(RateLimitSource::Agent, Duration::from_secs(30))
            .await;
        assert!(tracker.stats(RateLimitSource::Agent).await.blocked);

        // Judge calls proceed immediately.
        let judged = tokio::time::timeout(
            Duration::from_millis(500),
            tracker.retry_rate_limited(RateLimitSource::Judge, &Shutdown::new(), || async {
                Attempt::Done(1)
            }),
        )
        .await
        .expect("judge source must not wait on agent backoff")
        .unwrap();
        assert_eq!(judged.value, 1);
        assert!(!tracker.stats(RateLimitSource::Judge).await.blocked);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let tracker = RateLimitTracker::new(BackoffPolicy {
            initial_secs: 30.0,
            multiplier: 2.0,
            max_secs: 60.0,
            max_retries: 3,
        });
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let err = tracker
            .retry_rate_limited(RateLimitSource::Agent, &shutdown, || async {
                Attempt::<()>::RateLimited("429".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Cancelled));
    }
}
