use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use overlay_compose_schemas::overlay_compose_yaml::launch_options::RetryOptions;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("the run was cancelled")]
    Cancelled,
    #[error("the run deadline was reached")]
    DeadlineExceeded,
}

/// Cancellation and the overall deadline of one run. Every wait in the run goes through here so
/// that ctrl-c or the deadline stops it at the next pause.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, deadline: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: deadline.map(|d| Instant::now() + d),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleep for `duration`, returning early if the run is cancelled or the deadline passes
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.check()?;
        if duration.is_zero() {
            return Ok(());
        }
        let wake = Instant::now() + duration;
        let (wake, hits_deadline) = match self.deadline {
            Some(deadline) if deadline < wake => (deadline, true),
            _ => (wake, false),
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = tokio::time::sleep_until(wake) => {
                if hits_deadline {
                    Err(Interrupted::DeadlineExceeded)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Run `fut` to completion unless it takes longer than `timeout`, or the run is interrupted
    /// by cancellation or the deadline. The outer `Err` is the interruption, `Ok(None)` is a
    /// timeout.
    pub async fn run_bounded<F: Future>(&self, timeout: Duration, fut: F) -> Result<Option<F::Output>, Interrupted> {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::DeadlineExceeded),
            res = tokio::time::timeout(timeout, fut) => Ok(res.ok()),
        }
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// bound on a single attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt`, counting from 1
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            timeout,
        }
    }
}

impl From<&RetryOptions> for RetryPolicy {
    fn from(options: &RetryOptions) -> Self {
        Self {
            max_attempts: options.max_attempts.max(1),
            initial_backoff: Duration::from_millis(options.initial_backoff_ms),
            max_backoff: Duration::from_millis(options.max_backoff_ms),
            timeout: Duration::from_secs(options.timeout_secs),
        }
    }
}
