//! Per-job failure backoff.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// `delay(f) = min(initial * factor^(f-1), max)` for `f >= 1` failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            factor: 2.0,
            max: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.initial.min(self.max);
        }
        let exp = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        // powi overflows to inf long before u32 failures run out.
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Failure bookkeeping for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FailureState {
    pub consecutive_failures: u32,
    /// Shortened interval while backing off; `None` means normal cadence.
    pub current_interval: Option<Duration>,
}

/// Failure state for every job, shared by the job loops.
#[derive(Debug)]
pub struct FailureTracker {
    policy: BackoffPolicy,
    states: Mutex<HashMap<String, FailureState>>,
}

impl FailureTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn state(&self, job: &str) -> FailureState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job)
            .copied()
            .unwrap_or_default()
    }

    /// Reset the job to zero failures and its normal cadence. Returns the
    /// state it had before.
    pub fn record_success(&self, job: &str) -> FailureState {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(job.to_string(), FailureState::default()).unwrap_or_default()
    }

    /// Count one more failure and return the updated state.
    pub fn record_failure(&self, job: &str) -> FailureState {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(job.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.current_interval = Some(self.policy.delay_for(state.consecutive_failures));
        *state
    }

    /// Interval until the job's next fire.
    pub fn next_interval(&self, job: &str, cadence: Duration) -> Duration {
        self.state(job).current_interval.unwrap_or(cadence)
    }
}
