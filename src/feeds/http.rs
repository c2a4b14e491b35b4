use super::{FeedError, HistorySource, HistoryWindow, PriceSample, PriceSource};
use crate::state::AssetId;
use reqwest::Client;

/// REST client for the quote and history endpoints.
/// Implements both collaborator traits; the engine applies its own timeout
/// on top of the client's request timeout.
#[derive(Clone)]
pub struct HttpFeed {
    client: Client,
    price_base_url: String,
    history_base_url: String,
}

impl HttpFeed {
    pub fn new(price_base_url: &str, history_base_url: &str, timeout: std::time::Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            price_base_url: price_base_url.trim_end_matches('/').to_string(),
            history_base_url: history_base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Asset id -> market symbol used by the upstream API.
pub fn market_symbol(asset: &AssetId) -> &str {
    match asset.as_str() {
        "BTC" => "BTC-USD",
        "ETH" => "ETH-USD",
        "SOL" => "SOL-USD",
        "XAU" => "GC=F",
        other => other,
    }
}

// Quote response:
// { "symbol": "BTC-USD", "price": 68078.12, "time": "2026-02-17T08:27:54Z" }
//
// History response:
// { "symbol": "BTC-USD", "prices": [ { "time": "2026-02-17T08:25:00Z", "price": 68001.5 }, ... ] }

#[derive(serde::Deserialize)]
struct QuoteResponse {
    price: Option<f64>,
}

#[derive(serde::Deserialize)]
struct HistoryResponse {
    prices: Option<Vec<PriceSample>>,
}

impl PriceSource for HttpFeed {
    async fn get_price(&self, asset: &AssetId) -> Result<f64, FeedError> {
        let url = format!("{}/price", self.price_base_url);

        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", market_symbol(asset))])
            .send()
            .await
            .map_err(|e| FeedError::Unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FeedError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let data: QuoteResponse = resp
            .json()
            .await
            .map_err(|e| FeedError::Unavailable(format!("parse: {e}")))?;

        let price = data
            .price
            .ok_or_else(|| FeedError::Unavailable(format!("no price for {asset} in response")))?;

        if price <= 0.0 || !price.is_finite() {
            return Err(FeedError::Unavailable(format!("invalid price: {price}")));
        }

        Ok(price)
    }
}

impl HistorySource for HttpFeed {
    async fn get_history(
        &self,
        asset: &AssetId,
        window: &HistoryWindow,
    ) -> Result<Vec<PriceSample>, FeedError> {
        let url = format!("{}/history", self.history_base_url);
        let interval = window.interval_secs.to_string();
        let start = window.start.to_rfc3339();
        let end = window.end.to_rfc3339();

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", market_symbol(asset)),
                ("interval", interval.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FeedError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let data: HistoryResponse = resp
            .json()
            .await
            .map_err(|e| FeedError::Unavailable(format!("parse: {e}")))?;

        // An empty window is not a transport failure; the calibrator decides
        Ok(data.prices.unwrap_or_default())
    }
}
