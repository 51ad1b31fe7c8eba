//! Admission control (C9): cluster-gate policies applied before a request
//! is handed to the router.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject,
}

/// Token-bucket state. `capacity` and `refill_rate_per_us` are config;
/// `tokens` and `last_refill_tick` are the only mutable fields, advanced
/// lazily on each `admit` call by computing elapsed-time refill inline
/// rather than scheduling a separate periodic refill event.
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    capacity: f64,
    refill_rate_per_us: f64,
    tokens: f64,
    last_refill_tick: u64,
}

impl TokenBucketState {
    pub fn new(capacity: f64, refill_rate_per_us: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_us,
            tokens: capacity,
            last_refill_tick: 0,
        }
    }

    fn refill(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill_tick) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_us).min(self.capacity);
        self.last_refill_tick = now;
    }

    fn try_consume(&mut self, now: u64) -> AdmissionDecision {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            AdmissionDecision::Admit
        } else {
            tracing::warn!(now, tokens = self.tokens, capacity = self.capacity, "admission rejected: bucket empty");
            AdmissionDecision::Reject
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionPolicyConfig {
    AlwaysAdmit,
    TokenBucket { capacity: f64, refill_rate_per_us: f64 },
}

/// Runtime admission controller built from an `AdmissionPolicyConfig`.
#[derive(Debug)]
pub enum AdmissionController {
    AlwaysAdmit,
    TokenBucket(TokenBucketState),
}

impl AdmissionController {
    pub fn from_config(config: AdmissionPolicyConfig) -> Self {
        match config {
            AdmissionPolicyConfig::AlwaysAdmit => AdmissionController::AlwaysAdmit,
            AdmissionPolicyConfig::TokenBucket { capacity, refill_rate_per_us } => {
                AdmissionController::TokenBucket(TokenBucketState::new(capacity, refill_rate_per_us))
            }
        }
    }

    pub fn admit(&mut self, now: u64) -> AdmissionDecision {
        match self {
            AdmissionController::AlwaysAdmit => AdmissionDecision::Admit,
            AdmissionController::TokenBucket(state) => state.try_consume(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_admit_never_rejects() {
        let mut ctrl = AdmissionController::from_config(AdmissionPolicyConfig::AlwaysAdmit);
        for tick in 0..5 {
            assert_eq!(ctrl.admit(tick), AdmissionDecision::Admit);
        }
    }

    #[test]
    fn token_bucket_rejects_once_drained() {
        let mut ctrl = AdmissionController::from_config(AdmissionPolicyConfig::TokenBucket {
            capacity: 2.0,
            refill_rate_per_us: 0.0,
        });
        assert_eq!(ctrl.admit(0), AdmissionDecision::Admit);
        assert_eq!(ctrl.admit(0), AdmissionDecision::Admit);
        assert_eq!(ctrl.admit(0), AdmissionDecision::Reject);
    }

    #[test]
    fn token_bucket_refills_over_elapsed_time() {
        let mut ctrl = AdmissionController::from_config(AdmissionPolicyConfig::TokenBucket {
            capacity: 1.0,
            refill_rate_per_us: 0.01,
        });
        assert_eq!(ctrl.admit(0), AdmissionDecision::Admit);
        assert_eq!(ctrl.admit(0), AdmissionDecision::Reject);
        assert_eq!(ctrl.admit(100), AdmissionDecision::Admit);
    }

    #[test]
    fn token_bucket_never_exceeds_capacity() {
        let mut ctrl = AdmissionController::from_config(AdmissionPolicyConfig::TokenBucket {
            capacity: 1.0,
            refill_rate_per_us: 1.0,
        });
        ctrl.admit(1_000_000);
        if let AdmissionController::TokenBucket(state) = &ctrl {
            assert_eq!(state.tokens.max(0.0).min(state.capacity), state.tokens);
        }
    }
}
