//! Market metadata lookup against the Gamma API.
//!
//! Resolves a market slug to the pair of outcome token IDs the order
//! engine trades against. The Gamma API returns `outcomes` and
//! `clobTokenIds` as stringified JSON arrays, so both are decoded
//! through an intermediate representation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::types::ResolvedMarket;

/// Default Gamma API base URL.
const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

/// Request timeout for metadata lookups.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from market resolution. All variants are recoverable: the
/// coordinator retries on any of them.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error status.
    #[error("API error: status {status}, body: {body}")]
    ApiError { status: u16, body: String },

    /// No market exists for the slug.
    #[error("market not found: {0}")]
    NotFound(String),

    /// The response is missing or malforms the token mapping.
    #[error("unusable market metadata for {slug}: {reason}")]
    BadMetadata { slug: String, reason: String },
}

/// Resolves market slugs to tradable token identifiers.
#[async_trait]
pub trait MarketResolver: Send + Sync {
    async fn resolve(&self, slug: &str) -> Result<ResolvedMarket, ResolveError>;
}

/// Fields that arrive either as a JSON array or as a stringified JSON array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum JsonStringOrVec {
    Vec(Vec<String>),
    String(String),
}

impl JsonStringOrVec {
    fn into_vec(self) -> Result<Vec<String>, serde_json::Error> {
        match self {
            JsonStringOrVec::Vec(v) => Ok(v),
            JsonStringOrVec::String(s) => serde_json::from_str(&s),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    slug: String,
    question: Option<String>,
    outcomes: Option<JsonStringOrVec>,
    clob_token_ids: Option<JsonStringOrVec>,
    events: Option<Vec<GammaEvent>>,
}

#[derive(Debug, Deserialize)]
struct GammaEvent {
    slug: Option<String>,
}

/// Gamma API resolver.
pub struct GammaResolver {
    http: Client,
    base_url: String,
}

impl GammaResolver {
    /// Create a resolver against a custom base URL (tests, proxies).
    pub fn new(base_url: Option<String>) -> Result<Self, ResolveError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_GAMMA_URL.to_string()),
        })
    }

    /// Create a resolver against the production Gamma API.
    pub fn production() -> Result<Self, ResolveError> {
        Self::new(None)
    }

    async fn fetch_market(&self, slug: &str) -> Result<GammaMarket, ResolveError> {
        let url = format!("{}/markets?slug={}", self.base_url, slug);
        debug!(url = %url, "Fetching market metadata");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResolveError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let mut markets: Vec<GammaMarket> = response.json().await?;
        if markets.is_empty() {
            return Err(ResolveError::NotFound(slug.to_string()));
        }
        Ok(markets.remove(0))
    }
}

#[async_trait]
impl MarketResolver for GammaResolver {
    async fn resolve(&self, slug: &str) -> Result<ResolvedMarket, ResolveError> {
        let market = self.fetch_market(slug).await?;
        market_from_gamma(slug, market)
    }
}

/// Zip the Gamma outcome labels with their token IDs into a resolved market.
fn market_from_gamma(slug: &str, market: GammaMarket) -> Result<ResolvedMarket, ResolveError> {
    let bad = |reason: &str| ResolveError::BadMetadata {
        slug: slug.to_string(),
        reason: reason.to_string(),
    };

    let outcomes = market
        .outcomes
        .ok_or_else(|| bad("missing outcomes"))?
        .into_vec()
        .map_err(|e| bad(&format!("unparseable outcomes: {e}")))?;
    let token_ids = market
        .clob_token_ids
        .ok_or_else(|| bad("missing clobTokenIds"))?
        .into_vec()
        .map_err(|e| bad(&format!("unparseable clobTokenIds: {e}")))?;

    if outcomes.len() != 2 || token_ids.len() != 2 {
        return Err(bad(&format!(
            "expected 2 outcomes and 2 token ids, got {} and {}",
            outcomes.len(),
            token_ids.len()
        )));
    }

    let mut up_token_id = None;
    let mut down_token_id = None;
    for (outcome, token_id) in outcomes.iter().zip(token_ids.iter()) {
        match outcome.to_ascii_lowercase().as_str() {
            "up" | "yes" => up_token_id = Some(token_id.clone()),
            "down" | "no" => down_token_id = Some(token_id.clone()),
            _ => {}
        }
    }

    let event_slug = market
        .events
        .as_ref()
        .and_then(|events| events.first())
        .and_then(|event| event.slug.clone())
        .unwrap_or_default();

    Ok(ResolvedMarket {
        slug: market.slug,
        question: market.question.unwrap_or_default(),
        event_slug,
        up_token_id: up_token_id.ok_or_else(|| bad("no UP/YES outcome"))?,
        down_token_id: down_token_id.ok_or_else(|| bad("no DOWN/NO outcome"))?,
    })
}
