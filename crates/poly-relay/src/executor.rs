//! Order execution engine.
//!
//! Turns a validated signal plus the bound market into at most one
//! fill-or-kill order. Holdings are tracked in an optimistic per-outcome
//! ledger: updated from acks, reconciled against a fresh venue balance
//! before every SELL, and reset whenever the bound market changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::exchange::{ExchangeClient, ExchangeError, FokOrder};
use crate::types::{Direction, OutcomeSide, ResolvedMarket, TradingSignal};

/// Tradable price band enforced on every order.
const MIN_PRICE: Decimal = dec!(0.01);
const MAX_PRICE: Decimal = dec!(0.99);

/// Shares held back on every SELL so a stray fill elsewhere cannot push
/// the venue balance below the order size.
const SELL_SAFETY_BUFFER: Decimal = dec!(0.5);

/// Errors from order execution.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// No market is bound yet.
    #[error("no active market")]
    NoActiveMarket,

    /// The signal targets a different market than the bound one.
    #[error("market mismatch: signal targets {signal}, bound to {bound}")]
    MarketMismatch { signal: String, bound: String },

    /// Submission failed at the venue.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// What the engine did with a signal.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// An order was submitted and filled.
    Submitted {
        order_id: String,
        side: Direction,
        outcome: OutcomeSide,
        size: Decimal,
        price: Decimal,
    },
    /// No order was placed. Not an error.
    Skipped { reason: String },
}

/// Per-outcome share holdings for the bound market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ledger {
    pub up: Decimal,
    pub down: Decimal,
}

impl Ledger {
    fn get(&self, outcome: OutcomeSide) -> Decimal {
        match outcome {
            OutcomeSide::Up => self.up,
            OutcomeSide::Down => self.down,
        }
    }

    fn get_mut(&mut self, outcome: OutcomeSide) -> &mut Decimal {
        match outcome {
            OutcomeSide::Up => &mut self.up,
            OutcomeSide::Down => &mut self.down,
        }
    }
}

/// Execution counters and the last order summary, exposed through the
/// status report.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_order: Option<String>,
}

/// The execution engine. Shared by handle; all interior state is behind
/// locks or atomics so the worker and status reporter can both read it.
pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeClient>,
    shares_per_trade: Decimal,
    ledger: RwLock<Ledger>,
    sent: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    last_order: std::sync::RwLock<Option<String>>,
}

impl ExecutionEngine {
    pub fn new(exchange: Arc<dyn ExchangeClient>, shares_per_trade: Decimal) -> Self {
        Self {
            exchange,
            shares_per_trade,
            ledger: RwLock::new(Ledger::default()),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_order: std::sync::RwLock::new(None),
        }
    }

    /// Execute one signal against the bound market.
    ///
    /// `market` must be the binding current at call time; a slug mismatch
    /// is rejected before any sizing or balance lookup happens.
    pub async fn execute(
        &self,
        signal: &TradingSignal,
        market: Option<&ResolvedMarket>,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let market = market.ok_or(ExecuteError::NoActiveMarket)?;
        if signal.market_slug != market.slug {
            return Err(ExecuteError::MarketMismatch {
                signal: signal.market_slug.clone(),
                bound: market.slug.clone(),
            });
        }

        let size = match signal.direction {
            Direction::Buy => self.shares_per_trade,
            Direction::Sell => match self.sell_size(market, signal.outcome).await {
                Some(size) => size,
                None => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    info!(signal = %signal.summary(), "Holdings too small to sell, skipping");
                    return Ok(ExecutionOutcome::Skipped {
                        reason: "insufficient shares after buffer".to_string(),
                    });
                }
            },
        };

        let price = clamp_price(signal.limit_price);
        let order = FokOrder {
            client_id: Uuid::new_v4().to_string(),
            token_id: market.token_id(signal.outcome).to_string(),
            side: signal.direction,
            price,
            size,
        };

        match self.exchange.submit_order(&order).await {
            Ok(ack) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                *self.last_order.write().unwrap() = Some(format!(
                    "{} {} {} @ {} ({})",
                    signal.direction, signal.outcome, size, price, ack.order_id
                ));
                self.record_fill(signal.direction, signal.outcome, ack.filled_size)
                    .await;
                info!(
                    order_id = %ack.order_id,
                    side = %signal.direction,
                    outcome = %signal.outcome,
                    size = %size,
                    price = %price,
                    market = %market.slug,
                    "Order filled"
                );
                Ok(ExecutionOutcome::Submitted {
                    order_id: ack.order_id,
                    side: signal.direction,
                    outcome: signal.outcome,
                    size,
                    price,
                })
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                *self.last_order.write().unwrap() = Some(format!(
                    "FAILED {} {} {} @ {}: {}",
                    signal.direction, signal.outcome, size, price, e
                ));
                Err(e.into())
            }
        }
    }

    /// Size a SELL: reconcile against a fresh venue balance when one is
    /// available, hold back the safety buffer, floor to one decimal place.
    /// Returns None when nothing sellable remains.
    async fn sell_size(&self, market: &ResolvedMarket, outcome: OutcomeSide) -> Option<Decimal> {
        let token_id = market.token_id(outcome);
        let held = match self.exchange.get_balance(token_id).await {
            Ok(balance) => {
                let mut ledger = self.ledger.write().await;
                *ledger.get_mut(outcome) = balance;
                balance
            }
            Err(e) => {
                let cached = self.ledger.read().await.get(outcome);
                warn!(
                    error = %e,
                    token_id = %token_id,
                    cached = %cached,
                    "Balance fetch failed, using cached ledger"
                );
                cached
            }
        };

        let size = (held.min(self.shares_per_trade) - SELL_SAFETY_BUFFER)
            .round_dp_with_strategy(1, RoundingStrategy::ToZero);
        (size > Decimal::ZERO).then_some(size)
    }

    async fn record_fill(&self, side: Direction, outcome: OutcomeSide, filled: Decimal) {
        let mut ledger = self.ledger.write().await;
        let held = ledger.get_mut(outcome);
        match side {
            Direction::Buy => *held += filled,
            Direction::Sell => *held = (*held - filled).max(Decimal::ZERO),
        }
    }

    /// Forget all holdings. Called when the bound market changes identity.
    pub async fn reset_ledger(&self) {
        let mut ledger = self.ledger.write().await;
        if *ledger != Ledger::default() {
            info!(up = %ledger.up, down = %ledger.down, "Resetting holdings ledger");
        }
        *ledger = Ledger::default();
    }

    /// Snapshot of the holdings ledger.
    pub async fn ledger(&self) -> Ledger {
        *self.ledger.read().await
    }

    /// Snapshot of the execution counters.
    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_order: self.last_order.read().unwrap().clone(),
        }
    }
}

/// Round the pre-computed limit price to the venue's 2-dp tick, then clamp
/// it into the tradable band.
fn clamp_price(price: Decimal) -> Decimal {
    price
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .clamp(MIN_PRICE, MAX_PRICE)
}
