//! Fraud consumer: rule-based risk scoring of new orders.
//!
//! # Rules
//!
//! | Signal | Score |
//! |--------|-------|
//! | total above $1000 | +0.3 |
//! | total above $500 (and at most $1000) | +0.2 |
//! | customer id starts with `new-` | +0.4 |
//! | paid with `crypto` | +0.2 |
//!
//! A random jitter in `[-jitter, +jitter]` is added and the result clamped to
//! `[0, 1]`. Scores at or above the threshold are held for review; the rest
//! are approved, which announces the order with `order_confirmed`.

use super::{Admission, IdempotencyLedger, cents_attribute};
use crate::error::OrderError;
use crate::processor::OrderProcessor;
use crate::types::{FraudStatus, Money, OrderId};
use orderflow_core::BoxFuture;
use orderflow_core::consumer::{MessageHandler, ProcessingError};
use orderflow_core::event::attributes;
use orderflow_core::queue::QueueMessage;
use orderflow_runtime::metrics::OrderMetrics;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FraudRules {
    /// Scores at or above this are held for review.
    pub threshold: f64,
    /// Maximum absolute random adjustment.
    pub jitter: f64,
    /// Simulated model inference time.
    pub inference_delay: Duration,
}

impl Default for FraudRules {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            jitter: 0.1,
            inference_delay: Duration::from_millis(100),
        }
    }
}

impl FraudRules {
    /// Deterministic rules: no jitter, no inference delay.
    #[must_use]
    pub fn deterministic(threshold: f64) -> Self {
        Self {
            threshold,
            jitter: 0.0,
            inference_delay: Duration::ZERO,
        }
    }

    /// Rule score before jitter, clamped to `[0, 1]`.
    #[must_use]
    pub fn base_score(&self, amount: Money, customer_id: &str, payment_method: &str) -> f64 {
        let mut score = 0.0;
        if amount > Money::from_dollars(1000) {
            score += 0.3;
        } else if amount > Money::from_dollars(500) {
            score += 0.2;
        }
        if customer_id.starts_with("new-") {
            score += 0.4;
        }
        if payment_method == "crypto" {
            score += 0.2;
        }
        f64::clamp(score, 0.0, 1.0)
    }

    /// Classify a final score.
    #[must_use]
    pub fn classify(&self, score: f64) -> FraudStatus {
        if score >= self.threshold {
            FraudStatus::HighRiskPendingReview
        } else {
            FraudStatus::Approved
        }
    }
}

/// Scores each `order_created` event once and records the assessment on the order.
pub struct FraudConsumer {
    processor: Arc<OrderProcessor>,
    rules: FraudRules,
    rng: Mutex<StdRng>,
    ledger: IdempotencyLedger,
}

impl std::fmt::Debug for FraudConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FraudConsumer")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl FraudConsumer {
    /// Consumer writing assessments through `processor`.
    #[must_use]
    pub fn new(processor: Arc<OrderProcessor>, rules: FraudRules) -> Self {
        Self {
            processor,
            rules,
            rng: Mutex::new(StdRng::from_entropy()),
            ledger: IdempotencyLedger::new(),
        }
    }

    /// Use a reproducible jitter sequence.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Number of orders assessed.
    #[must_use]
    pub fn assessed(&self) -> usize {
        self.ledger.completed()
    }

    fn jitter(&self) -> f64 {
        if self.rules.jitter <= 0.0 {
            return 0.0;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(-self.rules.jitter..=self.rules.jitter)
    }

    async fn assess(&self, message: &QueueMessage) -> Result<(), ProcessingError> {
        let event = &message.event;
        let amount = Money::from_cents(cents_attribute(event, attributes::TOTAL_AMOUNT)?);
        let method = event.attribute(attributes::PAYMENT_METHOD).unwrap_or("card");
        let order_id = OrderId::new(event.order_id.clone());

        let Admission::Fresh(claim) = self.ledger.admit(event)? else {
            tracing::debug!(order_id = %order_id, "Order already assessed");
            return Ok(());
        };

        if !self.rules.inference_delay.is_zero() {
            tokio::time::sleep(self.rules.inference_delay).await;
        }
        let base = self.rules.base_score(amount, &event.customer_id, method);
        let score = f64::clamp(base + self.jitter(), 0.0, 1.0);
        let status = self.rules.classify(score);

        let order = match self
            .processor
            .record_fraud_assessment(&order_id, score, status)
            .await
        {
            Ok(order) => order,
            Err(OrderError::OrderNotFound(_)) => {
                tracing::debug!(order_id = %order_id, "Order archived before assessment");
                claim.complete();
                return Ok(());
            }
            Err(e @ OrderError::Validation(_)) => {
                return Err(ProcessingError::InvalidMessage(e.to_string()));
            }
            Err(e) => return Err(ProcessingError::Transient(e.to_string())),
        };
        claim.complete();

        if order.fraud_status.is_none() {
            tracing::debug!(
                order_id = %order_id,
                status = %order.status,
                "Order already final, assessment not stored"
            );
            return Ok(());
        }

        OrderMetrics::record_fraud_assessment(status.as_str());
        match status {
            FraudStatus::HighRiskPendingReview => tracing::warn!(
                order_id = %order_id,
                score,
                "High risk order held for review"
            ),
            FraudStatus::Approved => tracing::info!(
                order_id = %order_id,
                score,
                "Order approved by fraud check"
            ),
        }
        Ok(())
    }
}

impl MessageHandler for FraudConsumer {
    fn name(&self) -> &str {
        "fraud"
    }

    fn handle<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(self.assess(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_scores() {
        let rules = FraudRules::deterministic(0.7);
        let small = Money::from_dollars(20);

        assert!(rules.base_score(small, "cust-1", "card").abs() < f64::EPSILON);
        assert!((rules.base_score(Money::from_dollars(600), "cust-1", "card") - 0.2).abs() < 1e-9);
        assert!((rules.base_score(Money::from_dollars(1500), "cust-1", "card") - 0.3).abs() < 1e-9);
        assert!((rules.base_score(small, "new-42", "crypto") - 0.6).abs() < 1e-9);
        let worst = rules.base_score(Money::from_dollars(1500), "new-42", "crypto");
        assert!((worst - 0.9).abs() < 1e-9);
    }

    #[test]
    fn threshold_is_inclusive() {
        let rules = FraudRules::deterministic(0.7);
        assert_eq!(rules.classify(0.7), FraudStatus::HighRiskPendingReview);
        assert_eq!(rules.classify(0.69), FraudStatus::Approved);
    }

    #[test]
    fn exactly_500_dollars_adds_nothing() {
        let rules = FraudRules::deterministic(0.7);
        assert!(rules.base_score(Money::from_dollars(500), "c", "card").abs() < f64::EPSILON);
    }
}
