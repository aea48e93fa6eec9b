//! Wait-for-state polling of asynchronous remote operations
//!
//! A [`Poller`] repeatedly calls a fetch closure until the observed status is in
//! the target set, leaves the pending set, the timeout expires, or the caller
//! cancels. Each call site supplies only its status enumeration and fetch closure.

use crate::error::{ApiError, ApiResult, ErrorKind, Phase, ReconcileError, ResourceRef};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shortest delay the backoff ever produces
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Something a status fetch returns
pub trait Observation {
    type Status: Clone + PartialEq + fmt::Display;

    fn status(&self) -> &Self::Status;

    /// Remote error code attached to the observation, if any
    fn error_code(&self) -> Option<&str> {
        None
    }

    /// Remote status message attached to the observation, if any
    fn detail(&self) -> Option<&str> {
        None
    }
}

/// Timing parameters of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Hard ceiling on the whole poll
    pub timeout: Duration,
    /// Upper bound of the delay between checks
    pub poll_interval: Duration,
    /// Lower bound of the delay between checks
    pub min_poll_interval: Duration,
    /// Wait before the first check
    pub initial_delay: Duration,
    /// Consecutive `NotFound` fetch errors tolerated before failing
    pub not_found_checks: u32,
    /// Consecutive target observations required for success
    pub continuous_target_occurrence: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(5),
            min_poll_interval: Duration::from_secs(1),
            initial_delay: Duration::ZERO,
            not_found_checks: 0,
            continuous_target_occurrence: 1,
        }
    }
}

impl PollConfig {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            min_poll_interval: poll_interval.min(Duration::from_secs(1)),
            ..Default::default()
        }
    }

    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences.max(1);
        self
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.min_poll_interval, self.poll_interval)
    }
}

/// Exponential backoff with jitter, bounded by `[min, max]`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(MIN_DELAY);
        Self {
            min: min.clamp(MIN_DELAY, max),
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let base = self.min.saturating_mul(factor).min(self.max);
        let floor = (base / 2).max(self.min);
        if floor >= base {
            return base;
        }
        let ms = rand::thread_rng().gen_range(floor.as_millis() as u64..=base.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

/// Bookkeeping of one in-flight poll
#[derive(Debug)]
struct PollState {
    started: Instant,
    deadline: Instant,
    fetches: u32,
    consecutive_not_found: u32,
    target_hits: u32,
    last_status: Option<String>,
    last_code: Option<String>,
    last_detail: Option<String>,
}

impl PollState {
    fn new(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + timeout,
            fetches: 0,
            consecutive_not_found: 0,
            target_hits: 0,
            last_status: None,
            last_code: None,
            last_detail: None,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn observe<R: Observation>(&mut self, report: &R) {
        self.consecutive_not_found = 0;
        self.last_status = Some(report.status().to_string());
        self.last_code = report.error_code().map(str::to_string);
        self.last_detail = report.detail().map(str::to_string);
    }

    fn observe_error(&mut self, error: &ApiError) {
        self.last_code = error.code.clone();
        self.last_detail = Some(error.message.clone());
    }
}

enum Step<R> {
    Done(R),
    Continue,
}

/// Why a poll did not succeed
#[derive(Error, Debug)]
pub enum PollError {
    #[error("operation ended in unexpected status {status}")]
    Failed {
        status: String,
        code: Option<String>,
        detail: Option<String>,
    },

    #[error(
        "timed out after {timeout:?} waiting (last status: {})",
        .last_status.as_deref().unwrap_or("none")
    )]
    Timeout {
        timeout: Duration,
        last_status: Option<String>,
        code: Option<String>,
        detail: Option<String>,
    },

    #[error("cancelled")]
    Cancelled { last_status: Option<String> },

    #[error(transparent)]
    Api(ApiError),
}

impl PollError {
    pub fn into_reconcile(self, phase: Phase, resource: ResourceRef) -> ReconcileError {
        match self {
            PollError::Failed {
                status,
                code,
                detail,
            } => ReconcileError::OperationFailed {
                phase,
                resource,
                status,
                code,
                detail,
            },
            PollError::Timeout {
                timeout,
                last_status,
                code,
                detail,
            } => ReconcileError::PollTimeout {
                phase,
                resource,
                timeout,
                last_status,
                code,
                detail,
            },
            PollError::Cancelled { .. } => ReconcileError::Cancelled { phase, resource },
            PollError::Api(error) => ReconcileError::from_api(phase, resource, error),
        }
    }
}

/// Wait-for-state machine over a status enumeration `S`
#[derive(Debug, Clone)]
pub struct Poller<S> {
    pending: Vec<S>,
    target: Vec<S>,
    config: PollConfig,
    cancel: Option<CancellationToken>,
    correlation: Option<String>,
}

impl<S> Poller<S>
where
    S: Clone + PartialEq + fmt::Display,
{
    pub fn new(
        pending: impl IntoIterator<Item = S>,
        target: impl IntoIterator<Item = S>,
        config: PollConfig,
    ) -> Self {
        Self {
            pending: pending.into_iter().collect(),
            target: target.into_iter().collect(),
            config,
            cancel: None,
            correlation: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Label used in logs (e.g. a request token)
    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    fn correlation(&self) -> &str {
        self.correlation.as_deref().unwrap_or("-")
    }

    /// Poll until a target status, a failure, cancellation, or the timeout
    ///
    /// When the deadline passes while still pending, exactly one more check is
    /// made before giving up, so a slow backoff never turns into a false timeout.
    pub async fn poll<R, F, Fut>(&self, mut fetch: F) -> Result<R, PollError>
    where
        R: Observation<Status = S>,
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<R>>,
    {
        let mut state = PollState::new(self.config.timeout);
        let mut backoff = self.config.backoff();

        if !self.config.initial_delay.is_zero() {
            let delay = self.config.initial_delay.min(self.config.timeout);
            if pause(delay, self.cancel.as_ref()).await {
                return Err(self.cancelled(&state));
            }
        }

        loop {
            if self.is_cancelled() {
                return Err(self.cancelled(&state));
            }

            state.fetches += 1;
            let result = fetch().await;
            if let Step::Done(report) = self.step(&mut state, result)? {
                return Ok(report);
            }

            let now = Instant::now();
            if now >= state.deadline {
                return Err(self.timed_out(&state));
            }

            let delay = backoff.next_delay().min(state.deadline - now);
            tracing::debug!(
                "[{}] still {} after {} check(s), next check in {:?}",
                self.correlation(),
                state.last_status.as_deref().unwrap_or("unknown"),
                state.fetches,
                delay
            );
            if pause(delay, self.cancel.as_ref()).await {
                return Err(self.cancelled(&state));
            }
        }
    }

    fn step<R>(&self, state: &mut PollState, result: ApiResult<R>) -> Result<Step<R>, PollError>
    where
        R: Observation<Status = S>,
    {
        let report = match result {
            Ok(report) => report,
            Err(error) => return self.step_error(state, error).map(|_| Step::Continue),
        };

        state.observe(&report);
        let status = report.status();

        if self.target.contains(status) {
            state.target_hits += 1;
            if state.target_hits >= self.config.continuous_target_occurrence {
                tracing::debug!(
                    "[{}] reached {} after {} check(s) in {:?}",
                    self.correlation(),
                    status,
                    state.fetches,
                    state.elapsed()
                );
                return Ok(Step::Done(report));
            }
            return Ok(Step::Continue);
        }

        state.target_hits = 0;
        if self.pending.contains(status) {
            return Ok(Step::Continue);
        }

        tracing::debug!("[{}] unexpected status {}", self.correlation(), status);
        Err(PollError::Failed {
            status: status.to_string(),
            code: state.last_code.clone(),
            detail: state.last_detail.clone(),
        })
    }

    fn step_error(&self, state: &mut PollState, error: ApiError) -> Result<(), PollError> {
        state.target_hits = 0;
        state.observe_error(&error);

        match error.kind {
            ErrorKind::Transient => {
                tracing::debug!("[{}] retryable error: {}", self.correlation(), error);
                Ok(())
            }
            ErrorKind::NotFound if state.consecutive_not_found < self.config.not_found_checks => {
                state.consecutive_not_found += 1;
                tracing::debug!(
                    "[{}] not found ({}/{})",
                    self.correlation(),
                    state.consecutive_not_found,
                    self.config.not_found_checks
                );
                Ok(())
            }
            _ => Err(PollError::Api(error)),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn cancelled(&self, state: &PollState) -> PollError {
        tracing::debug!("[{}] cancelled after {:?}", self.correlation(), state.elapsed());
        PollError::Cancelled {
            last_status: state.last_status.clone(),
        }
    }

    fn timed_out(&self, state: &PollState) -> PollError {
        tracing::debug!(
            "[{}] timed out after {} check(s)",
            self.correlation(),
            state.fetches
        );
        PollError::Timeout {
            timeout: self.config.timeout,
            last_status: state.last_status.clone(),
            code: state.last_code.clone(),
            detail: state.last_detail.clone(),
        }
    }
}

/// Sleep for `delay`; returns true when cancelled first
async fn pause(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        },
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}

/// Bounds of [`retry_transient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            timeout,
            min_interval,
            max_interval,
        }
    }
}

#[derive(Error, Debug)]
pub enum RetryError {
    /// Not retryable
    #[error(transparent)]
    Api(ApiError),

    #[error("still failing after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: ApiError },

    #[error("cancelled")]
    Cancelled,
}

impl RetryError {
    pub fn into_reconcile(self, phase: Phase, resource: ResourceRef) -> ReconcileError {
        match self {
            RetryError::Api(error) => ReconcileError::from_api(phase, resource, error),
            RetryError::Exhausted { attempts, source } => ReconcileError::Transient {
                phase,
                resource,
                attempts,
                source,
            },
            RetryError::Cancelled => ReconcileError::Cancelled { phase, resource },
        }
    }
}

/// Retry `op` while it fails with a [`ErrorKind::Transient`] error
///
/// Retries stop at the policy timeout after one final attempt.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut backoff = Backoff::new(policy.min_interval, policy.max_interval);
    let mut attempts = 0;

    loop {
        if cancel.is_some_and(|t| t.is_cancelled()) {
            return Err(RetryError::Cancelled);
        }

        attempts += 1;
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.kind.is_retryable() => error,
            Err(error) => return Err(RetryError::Api(error)),
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(RetryError::Exhausted {
                attempts,
                source: error,
            });
        }

        let delay = backoff.next_delay().min(deadline - now);
        tracing::debug!(
            "attempt {} failed with retryable error, retrying in {:?}: {}",
            attempts,
            delay,
            error
        );
        if pause(delay, cancel).await {
            return Err(RetryError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{OperationReport, OperationStatus, ReadOutput};
    use crate::state::LifecycleStatus;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_ok;

    fn read(status: LifecycleStatus) -> ReadOutput {
        ReadOutput {
            raw: json!({}),
            status,
        }
    }

    fn lifecycle_poller(config: PollConfig) -> Poller<LifecycleStatus> {
        Poller::new(
            [LifecycleStatus::Pending],
            [LifecycleStatus::Available],
            config,
        )
    }

    fn fast(timeout_ms: u64) -> PollConfig {
        PollConfig::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        )
        .with_min_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_pending_available_takes_three_fetches() {
        let calls = AtomicU32::new(0);
        let mut sequence = vec![
            LifecycleStatus::Pending,
            LifecycleStatus::Pending,
            LifecycleStatus::Available,
        ]
        .into_iter();

        let result = lifecycle_poller(fast(1000))
            .poll(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                let status = sequence.next().unwrap_or(LifecycleStatus::Failed);
                async move { Ok(read(status)) }
            })
            .await;

        assert_eq!(result.unwrap().status, LifecycleStatus::Available);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out_with_one_check_past_deadline() {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(100);
        let late_checks = AtomicU32::new(0);

        let result = lifecycle_poller(fast(100))
            .poll(|| {
                if Instant::now() >= deadline {
                    late_checks.fetch_add(1, Ordering::SeqCst);
                }
                async { Ok(read(LifecycleStatus::Pending)) }
            })
            .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(120), "{:?}", elapsed);
        assert!(late_checks.load(Ordering::SeqCst) <= 1);
        match result {
            Err(PollError::Timeout { last_status, .. }) => {
                assert_eq!(last_status.as_deref(), Some("pending"))
            }
            other => panic!("Expected timeout, got {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_status_fails_with_remote_detail() {
        let poller = Poller::new(
            OperationStatus::WORKING,
            OperationStatus::DONE,
            fast(1000),
        );
        let mut sequence = vec![
            OperationReport::new(OperationStatus::InProgress),
            OperationReport::new(OperationStatus::Failed)
                .with_error("InvalidRequest", "Property RetentionInDays must be positive"),
        ]
        .into_iter();

        let result = poller
            .poll(|| {
                let report = sequence.next();
                async move { report.ok_or_else(|| ApiError::permanent("exhausted")) }
            })
            .await;

        match result {
            Err(PollError::Failed {
                status,
                code,
                detail,
            }) => {
                assert_eq!(status, "FAILED");
                assert_eq!(code.as_deref(), Some("InvalidRequest"));
                assert_eq!(
                    detail.as_deref(),
                    Some("Property RetentionInDays must be positive")
                );
            }
            other => panic!("Expected failure, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let mut results = vec![
            Err(ApiError::transient("Rate exceeded").with_code("Throttling")),
            Err(ApiError::transient("Rate exceeded").with_code("Throttling")),
            Ok(read(LifecycleStatus::Available)),
        ]
        .into_iter();

        let result = lifecycle_poller(fast(1000))
            .poll(|| {
                let next = results.next().unwrap_or(Ok(read(LifecycleStatus::Failed)));
                async move { next }
            })
            .await;

        assert_eq!(result.unwrap().status, LifecycleStatus::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_polling() {
        let calls = AtomicU32::new(0);
        let result = lifecycle_poller(fast(1000))
            .poll(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<ReadOutput, _>(ApiError::permanent("access denied")) }
            })
            .await;

        assert!(matches!(result, Err(PollError::Api(ref e)) if e.message == "access denied"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_checks() {
        let mut results = vec![
            Err(ApiError::not_found("no such image")),
            Err(ApiError::not_found("no such image")),
            Ok(read(LifecycleStatus::Available)),
        ]
        .into_iter();

        let result = lifecycle_poller(fast(1000).with_not_found_checks(2))
            .poll(|| {
                let next = results.next().unwrap_or(Ok(read(LifecycleStatus::Failed)));
                async move { next }
            })
            .await;
        assert_ok!(result);

        let result = lifecycle_poller(fast(1000).with_not_found_checks(1))
            .poll(|| async { Err::<ReadOutput, _>(ApiError::not_found("no such image")) })
            .await;
        assert!(matches!(result, Err(PollError::Api(ref e)) if e.is_not_found()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_target_occurrence() {
        let calls = AtomicU32::new(0);
        let mut sequence = vec![
            LifecycleStatus::Available,
            LifecycleStatus::Pending,
            LifecycleStatus::Available,
            LifecycleStatus::Available,
        ]
        .into_iter();

        let result = lifecycle_poller(fast(1000).with_continuous_target_occurrence(2))
            .poll(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                let status = sequence.next().unwrap_or(LifecycleStatus::Failed);
                async move { Ok(read(status)) }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let start = Instant::now();
        let first_fetch = Mutex::new(None);

        lifecycle_poller(fast(1000).with_initial_delay(Duration::from_millis(50)))
            .poll(|| {
                first_fetch.lock().unwrap().get_or_insert(start.elapsed());
                async { Ok(read(LifecycleStatus::Available)) }
            })
            .await
            .unwrap();

        assert_eq!(
            first_fetch.lock().unwrap().unwrap(),
            Duration::from_millis(50)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_makes_no_fetch() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let result = lifecycle_poller(fast(1000))
            .with_cancellation(token)
            .poll(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(read(LifecycleStatus::Pending)) }
            })
            .await;

        assert!(matches!(result, Err(PollError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait() {
        let token = CancellationToken::new();
        let poller = lifecycle_poller(
            PollConfig::new(Duration::from_secs(600), Duration::from_secs(30))
                .with_min_poll_interval(Duration::from_secs(30)),
        )
        .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let start = Instant::now();
        let result = poller
            .poll(|| async { Ok(read(LifecycleStatus::Pending)) })
            .await;
        canceller.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        match result {
            Err(PollError::Cancelled { last_status }) => {
                assert_eq!(last_status.as_deref(), Some("pending"))
            }
            _ => panic!("Expected cancellation"),
        }
    }

    #[test]
    fn test_backoff_stays_within_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        let mut backoff = Backoff::new(min, max);

        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= min && delay <= max, "{:?}", delay);
        }

        // past the growth phase the jitter window is [max/2, max]
        assert!(backoff.next_delay() >= max / 2);
    }

    #[test]
    fn test_backoff_clamps_inverted_bounds() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_until_success() {
        let policy = RetryPolicy::new(
            Duration::from_secs(60),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        let mut results = vec![
            Err(ApiError::transient("role cannot be assumed")),
            Ok("created"),
        ]
        .into_iter();

        let value = retry_transient(&policy, None, || {
            let next = results.next().unwrap_or(Err(ApiError::permanent("unexpected")));
            async move { next }
        })
        .await
        .unwrap();
        assert_eq!(value, "created");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_exhausts_budget() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let start = Instant::now();

        let result: Result<(), _> = retry_transient(&policy, None, || async {
            Err(ApiError::transient("still propagating"))
        })
        .await;

        assert!(start.elapsed() <= Duration::from_millis(110));
        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert!(attempts > 1);
                assert_eq!(source.message, "still propagating");
            }
            _ => panic!("Expected exhaustion"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_surfaces_conflict_immediately() {
        let policy = RetryPolicy::new(
            Duration::from_secs(60),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_transient(&policy, None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::conflict("version mismatch")) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Api(ref e)) if e.kind == ErrorKind::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
