//! Per-agent circuit breakers.
//!
//! Closed until `threshold` consecutive failures, then open for `reset_ms`;
//! the first request after the reset window transitions to half-open and is
//! allowed as the single probe. A successful probe closes the breaker, a
//! failed one re-opens it with a fresh timer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use chengis_core::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
        }
    }

    fn allow_request(&mut self, reset: Duration) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= reset {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, threshold: u32) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {
                self.opened_at = Some(Instant::now());
            }
        }
    }
}

/// Keyed map of breakers, one per agent.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<ResourceId, CircuitBreaker>>,
    threshold: u32,
    reset: Duration,
}

impl BreakerRegistry {
    pub fn new(threshold: u32, reset: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            threshold,
            reset,
        }
    }

    /// Whether a request to this agent may proceed right now.
    pub fn allow_request(&self, agent_id: ResourceId) -> bool {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(agent_id)
            .or_insert_with(CircuitBreaker::new)
            .allow_request(self.reset)
    }

    pub fn record_success(&self, agent_id: ResourceId) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(agent_id)
            .or_insert_with(CircuitBreaker::new)
            .record_success();
    }

    pub fn record_failure(&self, agent_id: ResourceId) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers.entry(agent_id).or_insert_with(CircuitBreaker::new);
        breaker.record_failure(self.threshold);
        if breaker.state == BreakerState::Open {
            warn!(agent_id = %agent_id, failures = breaker.failures, "circuit opened for agent");
        }
    }

    pub fn state(&self, agent_id: ResourceId) -> BreakerState {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .get(&agent_id)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn count_open(&self) -> usize {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .values()
            .filter(|b| b.state == BreakerState::Open)
            .count()
    }

    /// Admin reset back to closed.
    pub fn reset_agent(&self, agent_id: ResourceId) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.insert(agent_id, CircuitBreaker::new());
    }
}
