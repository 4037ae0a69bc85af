//! Retry decisions for failed runs.
//!
//! `decide` only computes whether and when to try again; waiting and
//! relaunching is the scheduler's job.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{ErrorKind, PipelineRun, RetryPolicy, RunError};

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start the next attempt after this delay
    Retry(Duration),

    /// The failure is final
    GiveUp,
}

/// Pure retry rule.
///
/// `jitter_sample` is a draw from [-1, 1]; it is scaled by the policy's
/// jitter fraction, so a sample of 0 yields the un-jittered delay.
pub fn decide_with(policy: &RetryPolicy, attempt: u32, kind: ErrorKind, jitter_sample: f64) -> RetryDecision {
    if !policy.is_retryable(kind) || !policy.should_retry(attempt) {
        return RetryDecision::GiveUp;
    }

    let base = policy.delay_for_attempt(attempt).as_secs_f64();
    let jitter = policy.jitter_fraction.clamp(0.0, 1.0);
    let factor = 1.0 + jitter * jitter_sample.clamp(-1.0, 1.0);

    RetryDecision::Retry(Duration::from_secs_f64((base * factor).max(0.0)))
}

/// Classifies failures and computes retry delays
pub struct RetryHandler {
    rng: Mutex<StdRng>,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryHandler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Handler with a deterministic jitter sequence
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Decide what happens after `run` failed with `error`.
    ///
    /// Jitter is drawn independently per decision.
    pub fn decide(&self, run: &PipelineRun, error: &RunError) -> RetryDecision {
        let policy = &run.retry_policy;
        let sample = if policy.jitter_fraction > 0.0 {
            match self.rng.lock() {
                Ok(mut rng) => rng.random_range(-1.0..=1.0),
                Err(poisoned) => poisoned.into_inner().random_range(-1.0..=1.0),
            }
        } else {
            0.0
        };

        decide_with(policy, run.attempt, error.kind, sample)
    }
}
