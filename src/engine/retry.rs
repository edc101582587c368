//! Adaptive retry around a single exchange call.
//!
//! Every external call the orchestrator makes goes through
//! `RetryPolicy::run`: it bounds the call with a timeout, classifies any
//! failure, and either stops, waits and repeats, or adjusts the quantity
//! and repeats. Each retry is recorded as a human-readable adaptation.

use rust_decimal::{Decimal, RoundingStrategy};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::classifier::{Classification, ErrorClass, ErrorClassifier, ErrorSignal};
use crate::exchange::ExchangeError;
use crate::types::{floor_to_step, EngineError, FailureKind};

/// Backoff grows by this much per retry...
pub const BACKOFF_STEP: Duration = Duration::from_millis(2000);
/// ...up to this cap.
pub const MAX_BACKOFF: Duration = Duration::from_millis(10_000);
/// Minimum wait after a rate-limit answer.
pub const RATE_LIMIT_WAIT: Duration = Duration::from_millis(5000);

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Delay before retry number `retry` (1-based): `min(retry × 2s, 10s)`.
pub fn backoff(retry: u32) -> Duration {
    BACKOFF_STEP.saturating_mul(retry).min(MAX_BACKOFF)
}

/// Retries and adaptations accumulated across the steps of one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryLog {
    pub retries: u32,
    pub adaptations: Vec<String>,
}

/// A call that could not be completed.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error: ExchangeError,
    pub classification: Classification,
    pub attempts: u32,
}

impl StepFailure {
    pub fn failure_kind(&self) -> FailureKind {
        match self.classification.class {
            ErrorClass::Permanent => FailureKind::Permanent,
            _ => FailureKind::RetriesExhausted,
        }
    }

    pub fn into_engine_error(self) -> EngineError {
        match self.classification.class {
            ErrorClass::Permanent => EngineError::ExchangePermanent {
                exchange: self.error.exchange,
                message: format!("{}: {}", self.classification.signal, self.error.message),
            },
            _ => EngineError::ExchangeTransient {
                exchange: self.error.exchange,
                message: format!("{}: {}", self.classification.signal, self.error.message),
                attempts: self.attempts,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    classifier: ErrorClassifier,
    max_retries: u32,
    call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(ErrorClassifier::default(), DEFAULT_MAX_RETRIES, DEFAULT_CALL_TIMEOUT)
    }
}

impl RetryPolicy {
    /// `max_retries` counts retries after the first attempt.
    pub fn new(classifier: ErrorClassifier, max_retries: u32, call_timeout: Duration) -> Self {
        Self {
            classifier,
            max_retries,
            call_timeout,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Worst-case wall time of one `run`: every attempt times out and every
    /// retry waits the longest backoff.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_retries + 1;
        self.call_timeout.saturating_mul(attempts)
            + MAX_BACKOFF.max(RATE_LIMIT_WAIT).saturating_mul(self.max_retries)
    }

    /// Run `call` until it succeeds or the error's retry budget is spent.
    ///
    /// `call` receives the quantity to use; precision errors shrink it to
    /// `step_size` (or one decimal place fewer) before the next attempt.
    pub async fn run<T, F, Fut>(
        &self,
        step: &str,
        exchange: &str,
        quantity: Decimal,
        step_size: Option<Decimal>,
        log: &mut RetryLog,
        mut call: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut(Decimal) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut quantity = quantity;
        let mut attempts = 0u32;
        let mut retries = 0u32;

        loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, call(quantity)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ExchangeError::timeout(exchange, self.call_timeout)),
            };
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let classification = self.classifier.classify(&error);
            let fail = |error: ExchangeError| StepFailure {
                error,
                classification,
                attempts,
            };

            if retries >= classification.retry_budget(self.max_retries) {
                warn!(
                    step,
                    exchange,
                    signal = %classification.signal,
                    attempts,
                    error = %error,
                    "Giving up on exchange call"
                );
                return Err(fail(error));
            }

            let adaptation = match classification.signal {
                ErrorSignal::QuantityPrecision => match adjust_quantity(quantity, step_size) {
                    Some(adjusted) => {
                        let note = format!("{step}: quantity precision on {exchange}: {quantity} -> {adjusted}");
                        quantity = adjusted;
                        note
                    }
                    None => {
                        warn!(step, exchange, %quantity, "Quantity cannot be reduced further");
                        return Err(fail(error));
                    }
                },
                signal => String::from(signal.label()),
            };

            retries += 1;
            let mut delay = backoff(retries);
            if classification.signal == ErrorSignal::RateLimited {
                delay = delay.max(RATE_LIMIT_WAIT);
            }

            let note = if classification.signal == ErrorSignal::QuantityPrecision {
                adaptation
            } else {
                format!(
                    "{step}: {adaptation} on {exchange}, retry {retries} after {}ms",
                    delay.as_millis()
                )
            };
            warn!(step, exchange, retry = retries, delay_ms = delay.as_millis() as u64, error = %error, "{note}");
            log.retries += 1;
            log.adaptations.push(note);

            tokio::time::sleep(delay).await;
        }
    }
}

/// Smaller quantity that should satisfy the exchange's precision rules.
///
/// Floors to `step` when that changes the value; otherwise drops one
/// decimal place. `None` when no smaller positive quantity results.
pub fn adjust_quantity(quantity: Decimal, step: Option<Decimal>) -> Option<Decimal> {
    if let Some(step) = step.filter(|s| *s > Decimal::ZERO) {
        let floored = floor_to_step(quantity, step);
        if floored > Decimal::ZERO && floored < quantity {
            return Some(floored);
        }
    }

    let normalized = quantity.normalize();
    let scale = normalized.scale();
    if scale == 0 {
        return None;
    }
    let truncated = normalized.round_dp_with_strategy(scale - 1, RoundingStrategy::ToZero);
    (truncated > Decimal::ZERO && truncated < quantity).then_some(truncated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
