//! Backoff for calls to the remote collaborators.
//!
//! Two flavours are used by the core: [`RetryPolicy::call`] gives up after a
//! bounded number of attempts and surfaces the error, while
//! [`RetryPolicy::call_until_acknowledged`] is for count updates and status
//! changes, which must eventually reach the remote side.

use std::future::Future;
use std::time::Duration;

use log::{error, warn};
use rand::Rng;
use tokio::time::sleep;

use crate::config::CollaboratorError;

#[derive(PartialEq, Debug, Clone)]
pub struct RetryPolicy {
    /// Calls made by [`RetryPolicy::call`] before giving up.
    pub attempts: u32,
    /// Pause after the first failure. Doubles after every further failure.
    pub initial: Duration,
    pub ceiling: Duration,
    /// Fraction of each pause that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl RetryPolicy {
    pub const NETWORK: RetryPolicy = RetryPolicy {
        attempts: 5,
        initial: Duration::from_millis(250),
        ceiling: Duration::from_secs(5),
        jitter: 0.25,
    };

    /// A policy with a constant pause and no jitter.
    pub fn immediate(attempts: u32, pause_ms: u64) -> RetryPolicy {
        let pause = Duration::from_millis(pause_ms.max(1));
        RetryPolicy {
            attempts: attempts.max(1),
            initial: pause,
            ceiling: pause,
            jitter: 0.0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial.min(self.ceiling),
            ceiling: self.ceiling,
            jitter: self.jitter.clamp(0.0, 1.0),
        }
    }

    /// Calls `op` until it succeeds, the collaborator rejects the request, or
    /// `attempts` calls have failed.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut pauses = self.backoff();
        let mut failures: u32 = 0;
        loop {
            let err = match op().await {
                Ok(val) => return Ok(val),
                Err(err @ CollaboratorError::Rejected { .. }) => return Err(err),
                Err(err) => err,
            };
            failures += 1;
            if failures >= self.attempts {
                warn!("{}: giving up after {} failures: {}", what, failures, err);
                return Err(err);
            }
            sleep(pauses.pause()).await;
        }
    }

    /// Calls `op` until it succeeds. The pause stays at `ceiling` once reached.
    ///
    /// A rejection is retried too: the remote side may not know the session
    /// yet, and dropping the call would lose data.
    pub async fn call_until_acknowledged<T, F, Fut>(&self, what: &str, mut op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut pauses = self.backoff();
        let mut failures: u32 = 0;
        loop {
            match op().await {
                Ok(val) => return val,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    // Once per round of `attempts` failures, to keep the log readable.
                    if failures % self.attempts.max(1) == 0 {
                        match err {
                            CollaboratorError::Rejected { .. } => {
                                error!("{}: rejected {} times: {}", what, failures, err)
                            }
                            CollaboratorError::Unavailable { .. } => {
                                warn!("{}: still failing after {} calls: {}", what, failures, err)
                            }
                        }
                    }
                }
            }
            sleep(pauses.pause()).await;
        }
    }
}

/// The pauses between the calls of one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    ceiling: Duration,
    jitter: f64,
}

impl Backoff {
    /// The next pause, shortened by up to `jitter` of its length.
    pub fn pause(&mut self) -> Duration {
        let full = self.next;
        self.next = self.next.saturating_mul(2).min(self.ceiling);
        if self.jitter == 0.0 {
            return full;
        }
        let shave = rand::thread_rng().gen_range(0.0..=self.jitter);
        full.mul_f64(1.0 - shave)
    }
}
