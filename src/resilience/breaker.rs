//! Per-host circuit breakers
//!
//! A breaker fails calls fast once a registry host is judged unavailable,
//! then periodically admits a single probe to test recovery. State is
//! process-local and owned by the client instance that created the
//! registry; each process independently discovers an outage and
//! independently recovers.

use crate::config::BreakerConfig;
use crate::error::{DistributionError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Requests flow normally; counts consecutive failures.
    Closed { failures: u32 },
    /// Requests fail fast without touching the network.
    Open { since: Instant },
    /// One probe request is in flight; everyone else still fails fast.
    HalfOpen,
}

/// State machine for one registry host.
#[derive(Debug)]
struct Breaker {
    state: State,
    config: BreakerConfig,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: State::Closed { failures: 0 },
            config,
        }
    }

    /// Gate a call: `Ok(())` admits it, `CircuitOpen` rejects it without a
    /// network attempt. Admission from `Open` after the cool-down moves to
    /// `HalfOpen` and admits exactly one probe.
    fn admit(&mut self, host: &str) -> Result<()> {
        match self.state {
            State::Closed { .. } => Ok(()),
            State::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.cooldown() {
                    debug!(host, "circuit breaker half-open, admitting probe");
                    self.state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(DistributionError::CircuitOpen {
                        host: host.to_string(),
                        retry_after_secs: (self.config.cooldown() - elapsed).as_secs(),
                    })
                }
            }
            State::HalfOpen => Err(DistributionError::CircuitOpen {
                host: host.to_string(),
                retry_after_secs: self.config.cooldown_secs,
            }),
        }
    }

    fn record_success(&mut self, host: &str) {
        if self.state != (State::Closed { failures: 0 }) {
            if matches!(self.state, State::HalfOpen | State::Open { .. }) {
                debug!(host, "circuit breaker closed after successful probe");
            }
            self.state = State::Closed { failures: 0 };
        }
    }

    fn record_failure(&mut self, host: &str) {
        match self.state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(host, failures, "circuit breaker opened");
                    self.state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    self.state = State::Closed { failures };
                }
            }
            State::HalfOpen => {
                warn!(host, "probe failed, circuit breaker re-opened");
                self.state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }
}

/// All breakers for one client instance, keyed by registry host and shared
/// across every concurrent operation against that host.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn with_breaker<R>(&self, host: &str, f: impl FnOnce(&mut Breaker) -> R) -> R {
        let mut map = self.breakers.lock().expect("breaker registry poisoned");
        let breaker = map
            .entry(host.to_string())
            .or_insert_with(|| Breaker::new(self.config.clone()));
        f(breaker)
    }

    /// Gate a call against `host`; see [`Breaker::admit`].
    pub fn admit(&self, host: &str) -> Result<()> {
        self.with_breaker(host, |b| b.admit(host))
    }

    pub fn record_success(&self, host: &str) {
        self.with_breaker(host, |b| b.record_success(host));
    }

    pub fn record_failure(&self, host: &str) {
        self.with_breaker(host, |b| b.record_failure(host));
    }
}
