//! Per-message processing pipeline.
//!
//! One raw payload in, one fully settled outcome out. The worker calls
//! `process` and awaits it to completion before touching the next message,
//! which is what keeps execution single-flight.
//!
//! Signals rebind first and execute second: a signal naming an unbound
//! market switches the binding to that market and then trades on it, so
//! the mismatch precondition in the engine only fires for callers that
//! bypass this path.

use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::coordinator::{BindError, BindOutcome, MarketCoordinator};
use crate::executor::{ExecuteError, ExecutionEngine, ExecutionOutcome};
use crate::normalize::{normalize, NormalizeError};
use crate::types::InboundMessage;

/// How a message failed. Every variant is logged and counted, never fatal.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

impl PipelineError {
    /// Which stage rejected the message. Logged with every failure.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Normalize(_) => "parse",
            PipelineError::Bind(_) => "bind",
            PipelineError::Execute(ExecuteError::Exchange(_)) => "submit",
            PipelineError::Execute(_) => "size",
        }
    }
}

/// What happened to a fully processed message.
#[derive(Debug, Clone)]
pub enum Processed {
    /// A market update (re)bound the active market.
    MarketBound { slug: String, outcome: BindOutcome },
    /// A signal produced a filled order.
    OrderSubmitted { summary: String, order_id: String },
    /// A signal was handled but no order was placed.
    OrderSkipped { summary: String, reason: String },
    /// A signal arrived too old to act on and was dropped.
    Stale { summary: String, age_ms: i64 },
}

impl Processed {
    /// The signal summary, when this outcome came from a signal.
    pub fn signal_summary(&self) -> Option<&str> {
        match self {
            Processed::OrderSubmitted { summary, .. }
            | Processed::OrderSkipped { summary, .. }
            | Processed::Stale { summary, .. } => Some(summary),
            Processed::MarketBound { .. } => None,
        }
    }
}

/// The normalize → bind → execute chain, shared by the worker and tests.
pub struct Pipeline {
    coordinator: Arc<MarketCoordinator>,
    executor: Arc<ExecutionEngine>,
    max_signal_age: Duration,
}

impl Pipeline {
    pub fn new(
        coordinator: Arc<MarketCoordinator>,
        executor: Arc<ExecutionEngine>,
        max_signal_age_ms: u64,
    ) -> Self {
        Self {
            coordinator,
            executor,
            max_signal_age: Duration::milliseconds(max_signal_age_ms as i64),
        }
    }

    /// Process one raw payload to completion.
    pub async fn process(&self, raw: &str) -> Result<Processed, PipelineError> {
        match normalize(raw)? {
            InboundMessage::MarketUpdate(update) => {
                let outcome = self
                    .coordinator
                    .bind(&update.market_slug, crate::types::BindSource::Stream)
                    .await?;
                Ok(Processed::MarketBound {
                    slug: update.market_slug,
                    outcome,
                })
            }
            InboundMessage::Signal(signal) => {
                let age = Utc::now() - signal.emitted_at;
                if age > self.max_signal_age {
                    info!(
                        signal = %signal.summary(),
                        age_ms = age.num_milliseconds(),
                        "Dropping stale signal"
                    );
                    return Ok(Processed::Stale {
                        summary: signal.summary(),
                        age_ms: age.num_milliseconds(),
                    });
                }

                // Rebind first so a signal for a new market trades on that
                // market, not against the previous binding.
                self.coordinator
                    .bind(&signal.market_slug, crate::types::BindSource::Signal)
                    .await?;
                let market = self.coordinator.active_market().await;

                debug!(signal = %signal.summary(), "Executing signal");
                match self.executor.execute(&signal, market.as_ref()).await? {
                    ExecutionOutcome::Submitted { order_id, .. } => Ok(Processed::OrderSubmitted {
                        summary: signal.summary(),
                        order_id,
                    }),
                    ExecutionOutcome::Skipped { reason } => Ok(Processed::OrderSkipped {
                        summary: signal.summary(),
                        reason,
                    }),
                }
            }
        }
    }
}
