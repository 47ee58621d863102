//! Order submission and balance client for the exchange REST API.
//!
//! Every order this process submits is fill-or-kill. There is no order
//! lifecycle to manage: an order either fills atomically or is killed by
//! the venue, so the client exposes exactly two calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::Direction;

/// Default CLOB API base URL.
const DEFAULT_CLOB_URL: &str = "https://clob.polymarket.com";

/// Request timeout for exchange calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from exchange calls. All recoverable: a failed submission is
/// counted and logged, never fatal to the process.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error status.
    #[error("API error: status {status}, body: {body}")]
    ApiError { status: u16, body: String },

    /// The venue accepted the request but killed the order.
    #[error("order killed: {0}")]
    Killed(String),
}

/// A fill-or-kill order, priced and sized by the execution engine.
#[derive(Debug, Clone, Serialize)]
pub struct FokOrder {
    /// Client-side order ID for log correlation.
    pub client_id: String,
    /// Outcome token to trade.
    pub token_id: String,
    /// BUY or SELL.
    pub side: Direction,
    /// Limit price in [0.01, 0.99], 2 decimal places.
    pub price: Decimal,
    /// Size in shares.
    pub size: Decimal,
}

/// Venue acknowledgement of a filled order.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    /// Venue-assigned order ID.
    pub order_id: String,
    /// Filled size in shares.
    pub filled_size: Decimal,
}

/// Order submission and balance lookup.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Current holdings of one outcome token, in shares.
    async fn get_balance(&self, token_id: &str) -> Result<Decimal, ExchangeError>;

    /// Submit a fill-or-kill order.
    async fn submit_order(&self, order: &FokOrder) -> Result<OrderAck, ExchangeError>;
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    success: bool,
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    filled_size: Decimal,
    #[serde(default)]
    error_msg: String,
}

/// REST client for the CLOB exchange API, authenticated with an API key.
pub struct ClobClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ClobClient {
    pub fn new(base_url: Option<String>, api_key: String) -> Result<Self, ExchangeError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_CLOB_URL.to_string()),
            api_key,
        })
    }

    async fn check_status(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExchangeError::ApiError {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ExchangeClient for ClobClient {
    async fn get_balance(&self, token_id: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/balance/{}", self.base_url, token_id);
        debug!(url = %url, "Fetching token balance");

        let response = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body: BalanceResponse = response.json().await?;
        Ok(body.balance)
    }

    async fn submit_order(&self, order: &FokOrder) -> Result<OrderAck, ExchangeError> {
        let url = format!("{}/order", self.base_url);
        debug!(
            client_id = %order.client_id,
            token_id = %order.token_id,
            side = %order.side,
            price = %order.price,
            size = %order.size,
            "Submitting FOK order"
        );

        let response = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .json(&serde_json::json!({
                "client_id": order.client_id,
                "token_id": order.token_id,
                "side": order.side,
                "price": order.price,
                "size": order.size,
                "order_type": "FOK",
            }))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body: SubmitResponse = response.json().await?;

        if !body.success {
            return Err(ExchangeError::Killed(body.error_msg));
        }
        Ok(OrderAck {
            order_id: body.order_id,
            filled_size: body.filled_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_submit_response_success() {
        let json = r#"{"success": true, "order_id": "ord-1", "filled_size": "25"}"#;
        let response: SubmitResponse = serde_json::from_str(json).unwrap();
        assert!(response.success);
        assert_eq!(response.order_id, "ord-1");
        assert_eq!(response.filled_size, dec!(25));
    }

    #[test]
    fn test_submit_response_killed() {
        let json = r#"{"success": false, "error_msg": "not enough liquidity"}"#;
        let response: SubmitResponse = serde_json::from_str(json).unwrap();
        assert!(!response.success);
        assert_eq!(response.error_msg, "not enough liquidity");
        assert_eq!(response.filled_size, Decimal::ZERO);
    }

    #[test]
    fn test_balance_response() {
        let json = r#"{"balance": "3.2"}"#;
        let response: BalanceResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.balance, dec!(3.2));
    }

    #[test]
    fn test_order_serializes_side_uppercase() {
        let order = FokOrder {
            client_id: "c-1".to_string(),
            token_id: "tok-up".to_string(),
            side: Direction::Buy,
            price: dec!(0.47),
            size: dec!(25),
        };
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["side"], "BUY");
    }
}
