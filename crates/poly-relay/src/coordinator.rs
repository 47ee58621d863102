//! Active market coordinator.
//!
//! Owns the single market binding the whole process trades against. A bind
//! request resolves the slug (retrying forever on a fixed delay), swaps the
//! binding atomically, and fans out to the executor ledger and the price
//! feed only when the market identity actually changed.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::executor::ExecutionEngine;
use crate::price_feed::PriceFeed;
use crate::resolver::MarketResolver;
use crate::types::{BindSource, ResolvedMarket};

/// Errors from a bind request.
#[derive(Debug, Error)]
pub enum BindError {
    /// Shutdown arrived while resolution was still retrying.
    #[error("bind cancelled by shutdown")]
    Cancelled,
}

/// The outcome of a bind request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The slug already matches the bound market.
    AlreadyBound,
    /// Re-resolution returned the same identity. No fan-out.
    Unchanged,
    /// The binding now points at a different market.
    Rebound,
}

/// Coordinates the active market binding.
pub struct MarketCoordinator {
    resolver: Arc<dyn MarketResolver>,
    executor: Arc<ExecutionEngine>,
    price_feed: Arc<dyn PriceFeed>,
    active: RwLock<Option<ResolvedMarket>>,
    shutdown_tx: broadcast::Sender<()>,
    retry_delay: Duration,
}

impl MarketCoordinator {
    pub fn new(
        resolver: Arc<dyn MarketResolver>,
        executor: Arc<ExecutionEngine>,
        price_feed: Arc<dyn PriceFeed>,
        shutdown_tx: broadcast::Sender<()>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            resolver,
            executor,
            price_feed,
            active: RwLock::new(None),
            shutdown_tx,
            retry_delay,
        }
    }

    /// Snapshot of the current binding.
    pub async fn active_market(&self) -> Option<ResolvedMarket> {
        self.active.read().await.clone()
    }

    /// Bind the process to `slug`.
    ///
    /// Dedupes against the current binding, resolves with indefinite
    /// fixed-delay retry, and replaces the binding wholesale. The executor
    /// ledger reset and price feed retarget fire only on an identity change.
    pub async fn bind(&self, slug: &str, source: BindSource) -> Result<BindOutcome, BindError> {
        let slug = slug.trim().to_ascii_lowercase();

        {
            let active = self.active.read().await;
            if active.as_ref().is_some_and(|m| m.slug == slug) {
                debug!(slug = %slug, source = %source, "Bind request for already-bound market");
                return Ok(BindOutcome::AlreadyBound);
            }
        }

        info!(slug = %slug, source = %source, "Binding market");
        let resolved = self.resolve_with_retry(&slug).await?;

        let previous = {
            let mut active = self.active.write().await;
            active.replace(resolved.clone())
        };

        let changed = previous
            .as_ref()
            .map_or(true, |prev| !prev.same_identity(&resolved));
        if !changed {
            debug!(slug = %slug, "Re-resolution returned the same market identity");
            return Ok(BindOutcome::Unchanged);
        }

        info!(
            slug = %resolved.slug,
            question = %resolved.question,
            up_token = %resolved.up_token_id,
            down_token = %resolved.down_token_id,
            source = %source,
            "Market bound"
        );
        self.executor.reset_ledger().await;
        self.price_feed.retarget(Some(resolved)).await;
        Ok(BindOutcome::Rebound)
    }

    /// Resolve a slug, retrying forever on a fixed delay. Only shutdown
    /// stops the loop.
    async fn resolve_with_retry(&self, slug: &str) -> Result<ResolvedMarket, BindError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.resolver.resolve(slug).await {
                Ok(market) => return Ok(market),
                Err(e) => {
                    warn!(
                        slug = %slug,
                        attempt,
                        error = %e,
                        "Market resolution failed, retrying in {:?}",
                        self.retry_delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = shutdown.recv() => return Err(BindError::Cancelled),
                    }
                }
            }
        }
    }
}
