use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::EverTaskError;
use crate::task::{CancelReason, FailureDetail, HandlerError};

#[allow(unused_imports)]
use crate::task::TaskHandler;

/// A predicate deciding whether a given handler error is retryable
pub type ErrorPredicate = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// How the attempt delays of a [`RetryPolicy`] are laid out
#[derive(Clone)]
enum DelayPlan {
    /// The same delay between every pair of attempts
    Fixed(Duration),
    /// One delay per gap, the last entry repeats when attempts outnumber entries
    Ladder(Vec<Duration>),
}

/// Which errors the policy retries. Whitelist and blacklist are mutually exclusive,
/// configuring both is rejected as a configuration error
#[derive(Clone, Default)]
enum RetryFilter {
    /// Retry every handler error (timeouts and cancellations are never retried)
    #[default]
    All,
    /// Retry only errors matching the predicate
    Only(ErrorPredicate),
    /// Retry every error except those matching the predicate
    Except(ErrorPredicate),
}

/// The result of one execution attempt, produced by the caller-supplied action.
/// Timeouts and cancellations are first-class outcomes rather than error values so the
/// driver never has to re-derive them from an error chain
pub(crate) enum AttemptResult {
    Ok,
    Err(HandlerError),
    /// Permanent failure that must not consume further attempts (a payload that no
    /// longer deserializes, for instance)
    Fatal(FailureDetail),
    TimedOut,
    Cancelled(CancelReason),
}

/// The final verdict of a retry-driven execution
pub(crate) enum RetryVerdict {
    Completed { attempts: u32 },
    Failed { error: HandlerError, attempts: u32 },
    Fatal(FailureDetail),
    TimedOut { attempts: u32 },
    Cancelled(CancelReason),
}

/// [`RetryPolicy`] governs how many times a failing handler is re-attempted and with
/// which delays. The driver is a plain loop over explicit [`AttemptResult`] outcomes,
/// retries are a control-flow decision and never an unwinding mechanism.
///
/// # Constructor(s)
/// - [`RetryPolicy::linear`] fixed attempt count with one constant delay between attempts
/// - [`RetryPolicy::with_delays`] an explicit delay ladder, one entry per gap
/// - [`RetryPolicy::none`] a single attempt, no retries
///
/// # Filter(s)
/// By default every handler error is retried, timeouts and cancellations never are.
/// The set can be narrowed with [`RetryPolicy::retry_only`] (whitelist) or
/// [`RetryPolicy::retry_except`] (blacklist), the two are mutually exclusive and
/// combining them is a configuration error.
///
/// # Jitter
/// [`RetryPolicy::with_jitter`] adds a random fraction of the computed delay on top of
/// it, spreading out retry storms from correlated failures
///
/// # Example
/// ```ignore
/// use evertask::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Three attempts, 100ms apart
/// let policy = RetryPolicy::linear(3, Duration::from_millis(100));
///
/// // Backoff ladder with 20% jitter
/// let policy = RetryPolicy::with_delays(vec![
///     Duration::from_millis(100),
///     Duration::from_millis(500),
///     Duration::from_secs(2),
/// ])
/// .with_jitter(0.2);
/// ```
///
/// # See Also
/// - [`TaskHandler::retry_policy`]
#[derive(Clone)]
pub struct RetryPolicy {
    attempts: u32,
    delays: DelayPlan,
    jitter: Option<f64>,
    filter: RetryFilter,
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let filter = match &self.filter {
            RetryFilter::All => "All",
            RetryFilter::Only(_) => "Only(..)",
            RetryFilter::Except(_) => "Except(..)",
        };
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("jitter", &self.jitter)
            .field("filter", &filter)
            .finish()
    }
}

impl Default for RetryPolicy {
    /// Three attempts with half a second between them
    fn default() -> Self {
        RetryPolicy::linear(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// Creates / Constructs a linear [`RetryPolicy`]: up to `attempts` total attempts
    /// with the same `delay` between consecutive ones. An `attempts` of zero is
    /// treated as one (the first attempt always runs)
    pub fn linear(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delays: DelayPlan::Fixed(delay),
            jitter: None,
            filter: RetryFilter::All,
        }
    }

    /// Creates / Constructs a [`RetryPolicy`] with one delay per retry gap. The number
    /// of attempts is `delays.len() + 1`
    pub fn with_delays(delays: Vec<Duration>) -> Self {
        Self {
            attempts: delays.len() as u32 + 1,
            delays: DelayPlan::Ladder(delays),
            jitter: None,
            filter: RetryFilter::All,
        }
    }

    /// Creates / Constructs a [`RetryPolicy`] that never retries
    pub fn none() -> Self {
        RetryPolicy::linear(1, Duration::ZERO)
    }

    /// Adds a random fraction (`0.0` to `1.0`) of each delay on top of it
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = Some(factor.clamp(0.0, 1.0));
        self
    }

    /// Narrows the policy to retry *only* errors matching the predicate. Fails when a
    /// blacklist has already been configured, the two are mutually exclusive
    pub fn retry_only(
        mut self,
        predicate: impl Fn(&HandlerError) -> bool + Send + Sync + 'static,
    ) -> Result<Self, EverTaskError> {
        if matches!(self.filter, RetryFilter::Except(_)) {
            return Err(EverTaskError::ConflictingRetryFilters);
        }
        self.filter = RetryFilter::Only(Arc::new(predicate));
        Ok(self)
    }

    /// Narrows the policy to retry everything *except* errors matching the predicate.
    /// Fails when a whitelist has already been configured, the two are mutually
    /// exclusive
    pub fn retry_except(
        mut self,
        predicate: impl Fn(&HandlerError) -> bool + Send + Sync + 'static,
    ) -> Result<Self, EverTaskError> {
        if matches!(self.filter, RetryFilter::Only(_)) {
            return Err(EverTaskError::ConflictingRetryFilters);
        }
        self.filter = RetryFilter::Except(Arc::new(predicate));
        Ok(self)
    }

    /// The total number of attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a handler error is retryable under the configured filter
    pub fn should_retry(&self, error: &HandlerError) -> bool {
        match &self.filter {
            RetryFilter::All => true,
            RetryFilter::Only(predicate) => predicate(error),
            RetryFilter::Except(predicate) => !predicate(error),
        }
    }

    /// The delay between `attempt` (1-based) and the next one, jitter applied
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = match &self.delays {
            DelayPlan::Fixed(delay) => *delay,
            DelayPlan::Ladder(delays) => delays
                .get(attempt.saturating_sub(1) as usize)
                .or_else(|| delays.last())
                .copied()
                .unwrap_or(Duration::ZERO),
        };
        match self.jitter {
            Some(factor) => base + base.mul_f64(factor * fastrand::f64()),
            None => base,
        }
    }

    /// Drives `action` to a final [`RetryVerdict`].
    ///
    /// `action` receives the 1-based attempt number and reports how the attempt ended.
    /// `on_retry` fires between attempts (never before the first) with the attempt that
    /// just failed, its error (handed back when the callback is done) and the upcoming
    /// delay. The between-attempt sleep is interruptible by `token`, in which case
    /// `cancel_reason` resolves whether the user or the service initiated it
    pub(crate) async fn execute<A, AFut, R, RFut, C>(
        &self,
        mut action: A,
        mut on_retry: R,
        token: &CancellationToken,
        cancel_reason: C,
    ) -> RetryVerdict
    where
        A: FnMut(u32) -> AFut,
        AFut: Future<Output = AttemptResult>,
        R: FnMut(u32, HandlerError, Duration) -> RFut,
        RFut: Future<Output = HandlerError>,
        C: Fn() -> CancelReason,
    {
        let mut attempt = 1u32;
        loop {
            match action(attempt).await {
                AttemptResult::Ok => return RetryVerdict::Completed { attempts: attempt },
                AttemptResult::TimedOut => return RetryVerdict::TimedOut { attempts: attempt },
                AttemptResult::Cancelled(reason) => return RetryVerdict::Cancelled(reason),
                AttemptResult::Fatal(detail) => return RetryVerdict::Fatal(detail),
                AttemptResult::Err(error) => {
                    if attempt >= self.attempts || !self.should_retry(&error) {
                        return RetryVerdict::Failed {
                            error,
                            attempts: attempt,
                        };
                    }
                    let delay = self.delay_for(attempt);
                    // The error is handed to the callback and dropped with it, the
                    // next attempt produces its own
                    drop(on_retry(attempt, error, delay).await);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return RetryVerdict::Cancelled(cancel_reason()),
                    }
                    attempt += 1;
                }
            }
        }
    }
}
