use std::{
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::error::{ClientError, ErrorCategory};

/// Seconds to wait after the n-th failed attempt.
pub const DEFAULT_BACKOFF_SECS: [u64; 7] = [1, 1, 2, 3, 5, 8, 13];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(schedule: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            schedule: schedule.into_iter().collect(),
        }
    }

    pub fn from_secs(schedule: &[u64]) -> Self {
        Self::new(schedule.iter().copied().map(Duration::from_secs))
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    /// Delay after failed attempt `attempt` (1-based). Attempts below 1 use
    /// the first step; attempts past the schedule repeat the last one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_BACKOFF_SECS)
    }
}

/// Failures worth another attempt: transport, timeout and rate limiting.
pub fn is_recoverable(err: &ClientError) -> bool {
    match err.category {
        ErrorCategory::Network
        | ErrorCategory::RateLimited
        | ErrorCategory::Timeout
        | ErrorCategory::Connect => true,
        _ => err.status.is_some_and(|status| status >= 500),
    }
}

pub type RecoverablePredicate = Arc<dyn Fn(&ClientError) -> bool + Send + Sync>;

/// Called with every failed attempt's root cause and attempt number.
pub type ErrorConsumer = Arc<dyn Fn(&ClientError, u32) + Send + Sync>;

/// Staged, immutable retry configuration. Every stage returns a new builder so
/// a partially configured one can be branched.
#[derive(Clone)]
pub struct RetryBuilder {
    action: String,
    session_id: Option<String>,
    scheduler: Option<Handle>,
    policy: RetryPolicy,
    recoverable: RecoverablePredicate,
    error_consumer: Option<ErrorConsumer>,
}

impl RetryBuilder {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            session_id: None,
            scheduler: None,
            policy: RetryPolicy::default(),
            recoverable: Arc::new(is_recoverable),
            error_consumer: None,
        }
    }

    pub fn in_session(&self, session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..self.clone()
        }
    }

    /// Executor retries run on, normally the dedicated reconnect scheduler.
    pub fn on_scheduler(&self, scheduler: Handle) -> Self {
        Self {
            scheduler: Some(scheduler),
            ..self.clone()
        }
    }

    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..self.clone()
        }
    }

    pub fn recoverable_if(
        &self,
        predicate: impl Fn(&ClientError) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            recoverable: Arc::new(predicate),
            ..self.clone()
        }
    }

    pub fn notify_errors_to(
        &self,
        consumer: impl Fn(&ClientError, u32) + Send + Sync + 'static,
    ) -> Self {
        Self {
            error_consumer: Some(Arc::new(consumer)),
            ..self.clone()
        }
    }

    pub fn build(&self) -> Result<Retry, ClientError> {
        let session_id = self
            .session_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ClientError::missing_argument("session id"))?;
        let scheduler = self
            .scheduler
            .clone()
            .ok_or_else(|| ClientError::missing_argument("scheduler"))?;
        Ok(Retry {
            action: Arc::from(self.action.as_str()),
            session_id: Arc::from(session_id.as_str()),
            scheduler,
            policy: self.policy.clone(),
            recoverable: Arc::clone(&self.recoverable),
            error_consumer: self.error_consumer.clone(),
        })
    }
}

/// Runs an async supplier until it succeeds or fails permanently.
#[derive(Clone)]
pub struct Retry {
    action: Arc<str>,
    session_id: Arc<str>,
    scheduler: Handle,
    policy: RetryPolicy,
    recoverable: RecoverablePredicate,
    error_consumer: Option<ErrorConsumer>,
}

impl Retry {
    pub fn builder(action: impl Into<String>) -> RetryBuilder {
        RetryBuilder::new(action)
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Drive `supplier` on the retry scheduler. The returned future resolves
    /// with the first success or the first permanent failure's root cause.
    pub async fn complete_eventually<T, F, Fut>(&self, supplier: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        let retry = self.clone();
        self.scheduler
            .spawn(retry.run(supplier))
            .await
            .map_err(|err| {
                ClientError::new(
                    ErrorCategory::Internal,
                    "retry_task_failed",
                    format!("retry task for '{}' ended: {err}", self.action),
                )
            })?
    }

    async fn run<T, F, Fut>(self, mut supplier: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            let err = match supplier().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            session = %self.session_id,
                            action = %self.action,
                            attempt,
                            "succeeded after retrying"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err.into_root_cause(),
            };

            self.notify(&err, attempt);
            if !(self.recoverable)(&err) {
                warn!(
                    session = %self.session_id,
                    action = %self.action,
                    attempt,
                    error = %err,
                    "giving up on permanent failure"
                );
                return Err(err);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            info!(
                session = %self.session_id,
                action = %self.action,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after recoverable failure"
            );
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    fn notify(&self, err: &ClientError, attempt: u32) {
        let Some(consumer) = &self.error_consumer else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| consumer(err, attempt))).is_err() {
            error!(
                session = %self.session_id,
                action = %self.action,
                "error consumer panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use tokio::time::Instant;

    use super::*;
    use crate::error::MISSING_ARGUMENT;

    #[test]
    fn follows_fibonacci_schedule_then_clamps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=9)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, [1, 1, 2, 3, 5, 8, 13, 13, 13]);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn classifies_recoverable_errors() {
        assert!(is_recoverable(&ClientError::new(ErrorCategory::Network, "io", "x")));
        assert!(is_recoverable(&ClientError::from_status(503, "unavailable")));
        assert!(!is_recoverable(&ClientError::from_status(401, "expired")));
        assert!(!is_recoverable(&ClientError::new(ErrorCategory::Config, "bad", "x")));
    }

    #[test]
    fn build_fails_fast_without_session_or_scheduler() {
        let err = Retry::builder("connect")
            .build()
            .err()
            .expect("session id is required");
        assert_eq!(err.code, MISSING_ARGUMENT);
        assert!(err.message.contains("session id"));

        let err = Retry::builder("connect")
            .in_session("s-1")
            .build()
            .err()
            .expect("scheduler is required");
        assert!(err.message.contains("scheduler"));
    }

    #[tokio::test]
    async fn builder_stages_branch_without_mutation() {
        let base = Retry::builder("connect").on_scheduler(Handle::current());
        let a = base.in_session("a").build().expect("branch a builds");
        let b = base.in_session("b").build().expect("branch b builds");
        assert_eq!(&*a.session_id, "a");
        assert_eq!(&*b.session_id, "b");
        assert!(base.build().is_err());
    }

    #[tokio::test]
    async fn permanent_failure_runs_exactly_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let notified = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&notified);
        let retry = Retry::builder("connect")
            .in_session("s-1")
            .on_scheduler(Handle::current())
            .notify_errors_to(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .expect("retry builds");

        let counter = Arc::clone(&attempts);
        let err = retry
            .complete_eventually(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClientError::from_status(401, "expired")) }
            })
            .await
            .expect_err("auth failure is permanent");

        assert_eq!(err.category, ErrorCategory::Auth);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recoverable_failures_with_backoff() {
        let attempts = Arc::new(AtomicU32::new(0));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let retry = Retry::builder("connect")
            .in_session("s-1")
            .on_scheduler(Handle::current())
            .notify_errors_to(move |err, attempt| {
                sink.lock().expect("lock").push((err.code.clone(), attempt));
            })
            .build()
            .expect("retry builds");

        let started = Instant::now();
        let counter = Arc::clone(&attempts);
        let value = retry
            .complete_eventually(move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 4 {
                        Err(ClientError::completion(ClientError::connect(
                            crate::error::ConnectFailureKind::Interrupted,
                            "reset",
                        )))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .expect("fourth attempt succeeds");

        assert_eq!(value, 4);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 1 + 2));
        assert_eq!(
            *observed.lock().expect("lock"),
            [
                ("connect_interrupted".to_owned(), 1),
                ("connect_interrupted".to_owned(), 2),
                ("connect_interrupted".to_owned(), 3),
            ]
        );
    }

    #[tokio::test]
    async fn panicking_error_consumer_is_contained() {
        let retry = Retry::builder("connect")
            .in_session("s-1")
            .on_scheduler(Handle::current())
            .notify_errors_to(|_, _| panic!("consumer failure"))
            .recoverable_if(|_| false)
            .build()
            .expect("retry builds");

        let err = retry
            .complete_eventually(|| async {
                Err::<(), _>(ClientError::new(ErrorCategory::Network, "io", "reset"))
            })
            .await
            .expect_err("predicate says permanent");
        assert_eq!(err.code, "io");
    }
}
