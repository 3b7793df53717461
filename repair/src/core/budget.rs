//! Session budgets: cost accounting, step and parse ceilings, retry backoff.
//!
//! All counters here are pure and monotonic; the engine owns one instance per session
//! and consults it at fixed points of its state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::TokenUsage;

/// Ceilings applied to one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ceilings {
    /// Cumulative model cost at which the session stops.
    pub cost: f64,
    /// Number of executed steps at which the session stops.
    pub steps: u32,
    /// Consecutive parse failures tolerated before the session stops.
    pub parse_retries: u32,
}

/// Cumulative model usage for one session. Never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostTracker {
    total_cost: f64,
    input_tokens: u64,
    output_tokens: u64,
    calls: u32,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one model call. Negative or non-finite costs count as zero.
    pub fn record(&mut self, usage: &TokenUsage) {
        if usage.cost.is_finite() && usage.cost > 0.0 {
            self.total_cost += usage.cost;
        }
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.calls = self.calls.saturating_add(1);
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn exceeded(&self, ceiling: f64) -> bool {
        self.total_cost >= ceiling
    }
}

/// Consecutive parse-failure counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseRetries {
    consecutive: u32,
}

impl ParseRetries {
    /// Register a failure; returns true once the count exceeds `ceiling`.
    pub fn fail(&mut self, ceiling: u32) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive > ceiling
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Bounded exponential backoff for model transport retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first call.
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `retry` (0-based), honouring a server hint.
    pub fn delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exponential = self
            .base
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max);
        match hint {
            Some(hint) => hint.max(exponential).min(self.max),
            None => exponential,
        }
    }
}
