//! poly-relay: signal-following execution agent for binary outcome markets.
//!
//! The relay subscribes to an upstream event stream, normalizes every
//! payload into a typed message, and acts on it:
//!
//! - market updates rebind the single active market the process trades on
//! - trading signals become at most one fill-or-kill order each, sized by
//!   configuration and priced by the signal
//!
//! Messages are processed strictly one at a time in arrival order. A bad
//! message is counted and logged, never fatal: the process is built to sit
//! on a flaky feed for days.
//!
//! ## Architecture
//!
//! ```text
//! event stream ──> consumer ──> pipeline ──> coordinator ──> resolver (Gamma)
//!   (WebSocket)    (1 worker)      │              │
//!                                  │              └──> price feed (display)
//!                                  └────────> executor ──> exchange (CLOB)
//! ```

pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod exchange;
pub mod executor;
pub mod normalize;
pub mod pipeline;
pub mod price_feed;
pub mod resolver;
pub mod types;

pub use config::RelayConfig;
pub use consumer::{ConsumerStats, EventConsumer, StreamTarget};
pub use coordinator::MarketCoordinator;
pub use executor::ExecutionEngine;
pub use pipeline::Pipeline;
