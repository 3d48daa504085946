//! Per-domain circuit breaker.
//!
//! Keeps a sliding window of failure timestamps per domain. Once the
//! window holds `fail_threshold` failures the domain is closed for
//! traffic until `cool_off` has elapsed. There is no explicit half-open
//! state: the first attempt after the cool-off is allowed and its
//! outcome feeds the window like any other.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Breaker sensitivity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitConfig {
    pub fail_threshold: usize,
    pub window: Duration,
    pub cool_off: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            window: Duration::from_secs(60),
            cool_off: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Default)]
struct DomainCircuit {
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
}

/// Thread-safe breaker shared by every fetch on every domain.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    domains: Mutex<HashMap<String, DomainCircuit>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Record a failure against `domain` now.
    pub fn record_failure(&self, domain: &str) {
        self.record_failure_at(domain, Instant::now());
    }

    /// Record a failure at an explicit instant. Returns true when this
    /// failure (re)opened the circuit.
    pub fn record_failure_at(&self, domain: &str, now: Instant) -> bool {
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        let circuit = domains.entry(domain.to_string()).or_default();

        circuit.failures.push_back(now);
        while let Some(oldest) = circuit.failures.front() {
            if now.saturating_duration_since(*oldest) > self.config.window {
                circuit.failures.pop_front();
            } else {
                break;
            }
        }

        debug!(
            domain,
            in_window = circuit.failures.len(),
            threshold = self.config.fail_threshold,
            "Fetch failure recorded"
        );

        if circuit.failures.len() >= self.config.fail_threshold {
            circuit.open_until = Some(now + self.config.cool_off);
            warn!(
                domain,
                failures = circuit.failures.len(),
                cool_off_secs = self.config.cool_off.as_secs(),
                "Circuit opened"
            );
            return true;
        }
        false
    }

    /// Whether traffic to `domain` is allowed now.
    pub fn allow(&self, domain: &str) -> bool {
        self.allow_at(domain, Instant::now())
    }

    /// False iff the domain has an `open_until` still in the future.
    pub fn allow_at(&self, domain: &str, now: Instant) -> bool {
        let domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        match domains.get(domain).and_then(|c| c.open_until) {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// Failures currently inside the window for `domain`, as of `now`.
    pub fn failures_in_window(&self, domain: &str, now: Instant) -> usize {
        let domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        domains
            .get(domain)
            .map(|c| {
                c.failures
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) <= self.config.window)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
