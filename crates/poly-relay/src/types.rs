//! Core types shared across the relay pipeline.
//!
//! CRITICAL: All prices and share quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math beyond the JSON boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// One side of a binary up/down market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeSide {
    Up,
    Down,
}

impl OutcomeSide {
    pub fn opposite(&self) -> Self {
        match self {
            OutcomeSide::Up => OutcomeSide::Down,
            OutcomeSide::Down => OutcomeSide::Up,
        }
    }
}

impl std::fmt::Display for OutcomeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeSide::Up => write!(f, "UP"),
            OutcomeSide::Down => write!(f, "DOWN"),
        }
    }
}

/// A fully validated trading signal from the event stream.
///
/// Every field is checked at construction by the normalizer; an invalid
/// signal never enters the pipeline.
#[derive(Debug, Clone)]
pub struct TradingSignal {
    /// Producer timestamp.
    pub emitted_at: DateTime<Utc>,
    /// Buy or sell.
    pub direction: Direction,
    /// Which outcome token to trade.
    pub outcome: OutcomeSide,
    /// Pre-computed limit price, strictly inside (0, 1), 4 decimal places.
    pub limit_price: Decimal,
    /// Market this signal targets (lowercase slug).
    pub market_slug: String,
    /// Original payload, retained for diagnostics.
    pub raw: String,
}

impl TradingSignal {
    /// One-line human summary for logs and status reports.
    pub fn summary(&self) -> String {
        format!(
            "{} {} @ {} on {}",
            self.direction, self.outcome, self.limit_price, self.market_slug
        )
    }
}

/// A market rebind instruction from the event stream. Carries no trading
/// intent.
#[derive(Debug, Clone)]
pub struct MarketUpdate {
    /// Producer timestamp.
    pub emitted_at: DateTime<Utc>,
    /// Market to bind (lowercase slug).
    pub market_slug: String,
}

/// A normalized inbound event.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Signal(TradingSignal),
    MarketUpdate(MarketUpdate),
}

/// A market slug resolved to its tradable token identifiers.
///
/// Immutable once constructed. Identity for change detection is the
/// `(slug, up_token_id, down_token_id)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMarket {
    /// Market slug.
    pub slug: String,
    /// Human-readable market question.
    pub question: String,
    /// Parent event slug.
    pub event_slug: String,
    /// Token ID for the UP outcome.
    pub up_token_id: String,
    /// Token ID for the DOWN outcome.
    pub down_token_id: String,
}

impl ResolvedMarket {
    /// Returns true if both markets carry the same trading identity.
    ///
    /// A re-resolution that returns the same identifiers is not a market
    /// change: no price-feed reconnect, no ledger reset.
    pub fn same_identity(&self, other: &ResolvedMarket) -> bool {
        self.slug == other.slug
            && self.up_token_id == other.up_token_id
            && self.down_token_id == other.down_token_id
    }

    /// The token ID for one outcome side.
    pub fn token_id(&self, outcome: OutcomeSide) -> &str {
        match outcome {
            OutcomeSide::Up => &self.up_token_id,
            OutcomeSide::Down => &self.down_token_id,
        }
    }
}

/// Where a market-bind request originated. Logged with every rebind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindSource {
    /// A MarketUpdate message from the event stream.
    Stream,
    /// A TradingSignal whose slug differs from the bound market.
    Signal,
    /// The configured default market, bound at process start.
    Boot,
}

impl std::fmt::Display for BindSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindSource::Stream => write!(f, "stream"),
            BindSource::Signal => write!(f, "signal"),
            BindSource::Boot => write!(f, "boot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(slug: &str, up: &str, down: &str) -> ResolvedMarket {
        ResolvedMarket {
            slug: slug.to_string(),
            question: "Bitcoin Up or Down?".to_string(),
            event_slug: "btc-updown".to_string(),
            up_token_id: up.to_string(),
            down_token_id: down.to_string(),
        }
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Buy.opposite(), Direction::Sell);
        assert_eq!(Direction::Sell.opposite(), Direction::Buy);
    }

    #[test]
    fn test_outcome_opposite() {
        assert_eq!(OutcomeSide::Up.opposite(), OutcomeSide::Down);
        assert_eq!(OutcomeSide::Down.opposite(), OutcomeSide::Up);
    }

    #[test]
    fn test_market_identity() {
        let a = market("btc-updown-15m-1", "tok-up", "tok-down");
        let b = market("btc-updown-15m-1", "tok-up", "tok-down");
        assert!(a.same_identity(&b));

        // Question text does not affect identity.
        let mut c = b.clone();
        c.question = "Renamed".to_string();
        assert!(a.same_identity(&c));

        let d = market("btc-updown-15m-1", "tok-up-2", "tok-down");
        assert!(!a.same_identity(&d));

        let e = market("btc-updown-15m-2", "tok-up", "tok-down");
        assert!(!a.same_identity(&e));
    }

    #[test]
    fn test_token_id_lookup() {
        let m = market("btc-updown-15m-1", "tok-up", "tok-down");
        assert_eq!(m.token_id(OutcomeSide::Up), "tok-up");
        assert_eq!(m.token_id(OutcomeSide::Down), "tok-down");
    }

    #[test]
    fn test_signal_summary() {
        let signal = TradingSignal {
            emitted_at: Utc::now(),
            direction: Direction::Buy,
            outcome: OutcomeSide::Up,
            limit_price: dec!(0.47),
            market_slug: "btc-updown-15m-1".to_string(),
            raw: String::new(),
        };
        assert_eq!(signal.summary(), "BUY UP @ 0.47 on btc-updown-15m-1");
    }
}
