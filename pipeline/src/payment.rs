//! Payment gateway boundary.
//!
//! The order processor only sees [`PaymentGateway`]. The bundled
//! [`SimulatedPaymentGateway`] stands in for a slow, failure-prone external
//! payment API: it sleeps for a configured latency (tokio time, so paused-time
//! tests stay deterministic) and declines a configured share of charges.

use crate::types::{CustomerId, Money, OrderId};
use orderflow_core::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// A charge request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Order being paid
    pub order_id: OrderId,
    /// Paying customer
    pub customer_id: CustomerId,
    /// Amount to charge
    pub amount: Money,
    /// `card`, `crypto`, ...
    pub method: String,
}

/// A settled charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Gateway reference
    pub payment_id: String,
}

/// Charge failures other than a timeout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// The gateway refused the charge.
    #[error("Payment declined: {0}")]
    Declined(String),

    /// The gateway could not be reached or errored.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
}

impl PaymentError {
    /// Short machine-readable reason, stored on the failed order.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Declined(_) => "payment_declined",
            Self::Unavailable(_) => "payment_unavailable",
        }
    }
}

/// External payment dependency.
///
/// # Dyn Compatibility
///
/// Returns a boxed future so the processor can hold `Arc<dyn PaymentGateway>`.
/// The processor applies its own deadline; implementations need not.
pub trait PaymentGateway: Send + Sync {
    /// Charge the customer.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError`] when the charge did not go through.
    fn charge<'a>(
        &'a self,
        request: &'a PaymentRequest,
    ) -> BoxFuture<'a, Result<PaymentReceipt, PaymentError>>;
}

/// Latency- and decline-injecting stand-in for a payment API.
#[derive(Debug)]
pub struct SimulatedPaymentGateway {
    latency: Duration,
    decline_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedPaymentGateway {
    /// Gateway with a fixed `latency` that declines `decline_rate` of charges.
    #[must_use]
    pub fn new(latency: Duration, decline_rate: f64) -> Self {
        Self {
            latency,
            decline_rate: decline_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Same as [`SimulatedPaymentGateway::new`] with a reproducible decline sequence.
    #[must_use]
    pub fn seeded(latency: Duration, decline_rate: f64, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..Self::new(latency, decline_rate)
        }
    }

    /// Gateway that approves every charge after `latency`.
    #[must_use]
    pub fn approving(latency: Duration) -> Self {
        Self::new(latency, 0.0)
    }

    /// Configured latency.
    #[must_use]
    pub const fn latency(&self) -> Duration {
        self.latency
    }

    fn roll_decline(&self) -> bool {
        if self.decline_rate <= 0.0 {
            return false;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.decline_rate)
    }
}

impl PaymentGateway for SimulatedPaymentGateway {
    fn charge<'a>(
        &'a self,
        request: &'a PaymentRequest,
    ) -> BoxFuture<'a, Result<PaymentReceipt, PaymentError>> {
        let declined = self.roll_decline();
        Box::pin(async move {
            tokio::time::sleep(self.latency).await;
            if declined {
                tracing::debug!(
                    order_id = %request.order_id,
                    amount = %request.amount,
                    "Simulated decline"
                );
                return Err(PaymentError::Declined(format!(
                    "card for customer {} was declined",
                    request.customer_id
                )));
            }
            Ok(PaymentReceipt {
                payment_id: format!("pay-{}", uuid::Uuid::new_v4().simple()),
            })
        })
    }
}
