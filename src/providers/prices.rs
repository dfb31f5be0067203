// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! USD price lookup.
//!
//! Missing or non-positive prices are a hard `PriceUnavailable` error. A zero
//! price would turn every deposit ask into zero.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;

use super::quote::ProviderError;
use crate::error::{SettlementError, SettlementResult};
use crate::storage::PriceCache;

const PRICE_CACHE_CAPACITY: usize = 64;
const PRICE_CACHE_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// USD price of one whole `symbol`, `None` when the source does not know it.
    async fn usd_price(&self, symbol: &str) -> Result<Option<Decimal>, ProviderError>;
}

/// Fixed prices: stablecoin pegs plus `PRICE_USD_<SYMBOL>` overrides.
#[derive(Debug, Clone)]
pub struct StaticPrices {
    prices: HashMap<String, Decimal>,
}

impl StaticPrices {
    pub fn new(overrides: HashMap<String, Decimal>) -> Self {
        let mut prices: HashMap<String, Decimal> = ["USDC", "USDT"]
            .into_iter()
            .map(|symbol| (symbol.to_string(), Decimal::ONE))
            .collect();
        for (symbol, price) in overrides {
            prices.insert(symbol.to_uppercase(), price);
        }
        Self { prices }
    }
}

#[async_trait]
impl PriceSource for StaticPrices {
    async fn usd_price(&self, symbol: &str) -> Result<Option<Decimal>, ProviderError> {
        Ok(self.prices.get(&symbol.to_uppercase()).copied())
    }
}

/// Price feed answering `GET {url}?symbol=ETH` with `{"usd": "2500.12"}`.
#[derive(Debug, Clone)]
pub struct HttpPriceSource {
    url: String,
    http: Client,
}

impl HttpPriceSource {
    pub fn new(url: String) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn usd_price(&self, symbol: &str) -> Result<Option<Decimal>, ProviderError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("price feed failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("price feed: {e}")))?;
        Ok(parse_price(&body))
    }
}

fn parse_price(body: &Value) -> Option<Decimal> {
    match body.get("usd")? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Static prices first, then the feed, with a short LRU cache in front.
pub struct PriceBook {
    fixed: StaticPrices,
    feed: Option<Arc<dyn PriceSource>>,
    cache: PriceCache,
}

impl PriceBook {
    pub fn new(fixed: StaticPrices, feed: Option<Arc<dyn PriceSource>>) -> Self {
        Self {
            fixed,
            feed,
            cache: PriceCache::new(PRICE_CACHE_CAPACITY, PRICE_CACHE_TTL),
        }
    }

    /// Positive USD price or `PriceUnavailable`.
    ///
    /// Symbols are case-insensitive; the cache is keyed by the upper-case form.
    pub async fn usd_price(&self, symbol: &str) -> SettlementResult<Decimal> {
        let symbol = symbol.trim().to_uppercase();
        if let Some(price) = self.fixed.usd_price(&symbol).await? {
            return positive(&symbol, price);
        }
        if let Some(price) = self.cache.get(&symbol) {
            return Ok(price);
        }

        let Some(feed) = &self.feed else {
            return Err(SettlementError::PriceUnavailable(symbol));
        };
        let price = match feed.usd_price(&symbol).await {
            Ok(Some(price)) => positive(&symbol, price)?,
            Ok(None) => return Err(SettlementError::PriceUnavailable(symbol)),
            Err(error) => {
                warn!(symbol = %symbol, %error, "Price feed lookup failed");
                return Err(SettlementError::PriceUnavailable(symbol));
            }
        };
        self.cache.put(&symbol, price);
        Ok(price)
    }
}

fn positive(symbol: &str, price: Decimal) -> SettlementResult<Decimal> {
    if price > Decimal::ZERO {
        Ok(price)
    } else {
        Err(SettlementError::PriceUnavailable(symbol.to_uppercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    struct CountingFeed {
        price: Option<Decimal>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for CountingFeed {
        async fn usd_price(&self, symbol: &str) -> Result<Option<Decimal>, ProviderError> {
            assert_eq!(symbol, symbol.to_uppercase());
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.price)
        }
    }

    #[tokio::test]
    async fn stablecoins_are_pegged() {
        let book = PriceBook::new(StaticPrices::new(HashMap::new()), None);
        assert_eq!(book.usd_price("usdc").await.unwrap(), Decimal::ONE);
    }

    #[tokio::test]
    async fn overrides_win_over_pegs() {
        let overrides = HashMap::from([("usdc".to_string(), dec("0.999"))]);
        let book = PriceBook::new(StaticPrices::new(overrides), None);
        assert_eq!(book.usd_price("USDC").await.unwrap(), dec("0.999"));
    }

    #[tokio::test]
    async fn unknown_symbol_is_price_unavailable() {
        let book = PriceBook::new(StaticPrices::new(HashMap::new()), None);
        let err = book.usd_price("ETH").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PriceUnavailable);
    }

    #[tokio::test]
    async fn zero_price_is_rejected() {
        let overrides = HashMap::from([("ETH".to_string(), Decimal::ZERO)]);
        let book = PriceBook::new(StaticPrices::new(overrides), None);
        assert_eq!(
            book.usd_price("ETH").await.unwrap_err().kind(),
            ErrorKind::PriceUnavailable
        );
    }

    #[tokio::test]
    async fn feed_results_are_cached() {
        let feed = Arc::new(CountingFeed {
            price: Some(dec("2500")),
            calls: AtomicUsize::new(0),
        });
        let book = PriceBook::new(StaticPrices::new(HashMap::new()), Some(feed.clone()));

        assert_eq!(book.usd_price("ETH").await.unwrap(), dec("2500"));
        assert_eq!(book.usd_price("eth").await.unwrap(), dec("2500"));
        assert_eq!(book.usd_price(" Eth ").await.unwrap(), dec("2500"));
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn feed_without_price_is_unavailable() {
        let feed = Arc::new(CountingFeed {
            price: None,
            calls: AtomicUsize::new(0),
        });
        let book = PriceBook::new(StaticPrices::new(HashMap::new()), Some(feed));
        assert_eq!(
            book.usd_price("AVAX").await.unwrap_err().kind(),
            ErrorKind::PriceUnavailable
        );
    }

    #[test]
    fn parses_string_and_number_prices() {
        assert_eq!(parse_price(&json!({"usd": "2500.5"})), Some(dec("2500.5")));
        assert_eq!(parse_price(&json!({"usd": 31.25})), Some(dec("31.25")));
        assert_eq!(parse_price(&json!({"price": 1})), None);
    }
}
