pub mod http;

use crate::state::AssetId;
use chrono::{DateTime, Utc};
use std::future::Future;

/// Failure reported by an upstream price or history source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// One historical observation.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct PriceSample {
    pub time: DateTime<Utc>,
    pub price: f64,
}

/// Range and spacing of history requested for calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_secs: u64,
}

impl HistoryWindow {
    /// Window of `lookback_secs` ending at `now`.
    pub fn ending_at(now: DateTime<Utc>, lookback_secs: u64, interval_secs: u64) -> Self {
        Self {
            start: now - chrono::Duration::seconds(lookback_secs as i64),
            end: now,
            interval_secs,
        }
    }
}

/// Live quote for the anchor price of a forecast.
/// Send + Sync required for use across tokio tasks.
pub trait PriceSource: Send + Sync {
    fn get_price(&self, asset: &AssetId) -> impl Future<Output = Result<f64, FeedError>> + Send;
}

/// Historical prices used for calibration. May return fewer samples than asked for.
pub trait HistorySource: Send + Sync {
    fn get_history(
        &self,
        asset: &AssetId,
        window: &HistoryWindow,
    ) -> impl Future<Output = Result<Vec<PriceSample>, FeedError>> + Send;
}
