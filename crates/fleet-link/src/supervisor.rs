//! Failure policies for link tasks
//!
//! A supervisor receives a factory that starts one attempt of a link task
//! and decides what happens when an attempt fails: propagate the failure,
//! log it and give up on the link, or start a new attempt after a delay.

use std::time::Duration;

use fleet_connect::BoxFuture;
use tracing::{info, warn};

use crate::error::LinkFailure;

/// Future of one attempt of a supervised task
pub type TaskFuture = BoxFuture<'static, Result<(), LinkFailure>>;

/// Starts a new attempt of a supervised task
pub type TaskFactory = Box<dyn FnMut() -> TaskFuture + Send>;

/// Failure policy for long-running link tasks
pub trait Supervisor: Send + Sync {
    /// Run the task produced by `task` under this policy
    ///
    /// The returned future resolves with `Ok(())` when the task ended in a
    /// way the policy accepts, or with the failure it decided to propagate.
    fn supervise(&self, name: &str, task: TaskFactory) -> TaskFuture;
}

/// Runs the task once and propagates any failure
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOnFailure;

impl Supervisor for StopOnFailure {
    fn supervise(&self, _name: &str, mut task: TaskFactory) -> TaskFuture {
        task()
    }
}

/// Runs the task once; a failure is logged and the task ends quietly
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndStop;

impl Supervisor for LogAndStop {
    fn supervise(&self, name: &str, mut task: TaskFactory) -> TaskFuture {
        let name = name.to_string();
        Box::pin(async move {
            if let Err(e) = task().await {
                warn!(link = %name, "Link stopped: {}", e);
            }
            Ok(())
        })
    }
}

/// Restarts failed tasks after an exponentially growing delay
///
/// The delay starts at `initial_delay`, doubles after every consecutive
/// failure and is capped at `max_delay`. An attempt that stayed up for at
/// least `max_delay` resets the delay. `InboundClosed` is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartWithBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many consecutive failed attempts
    pub max_attempts: Option<u32>,
}

impl RestartWithBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            max_attempts: None,
        }
    }

    /// Limit the number of consecutive failed attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before the attempt following `failures` consecutive failures
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RestartWithBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Supervisor for RestartWithBackoff {
    fn supervise(&self, name: &str, mut task: TaskFactory) -> TaskFuture {
        let policy = *self;
        let name = name.to_string();
        Box::pin(async move {
            let mut failures: u32 = 0;
            loop {
                let started = tokio::time::Instant::now();
                let failure = match task().await {
                    Ok(()) => return Ok(()),
                    Err(e) if !e.is_recoverable() => return Err(e),
                    Err(e) => e,
                };

                if started.elapsed() >= policy.max_delay {
                    failures = 0;
                }
                failures += 1;
                if policy.max_attempts.is_some_and(|max| failures >= max) {
                    warn!(link = %name, "Giving up after {} failed attempts: {}", failures, failure);
                    return Err(failure);
                }

                let delay = policy.delay_after(failures);
                warn!(link = %name, "Link failed: {}; restarting in {:?}", failure, delay);
                tokio::time::sleep(delay).await;
                info!(link = %name, "Restarting link");
            }
        })
    }
}
