use crate::errors::{EngineError, EngineResult};
use crate::feeds::{HistorySource, HistoryWindow};
use crate::models::volatility;
use crate::state::{AssetId, CalibrationOrigin, CalibrationRecord, EngineCounters, SourceWindow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

type Slot = Arc<tokio::sync::Mutex<Option<Arc<CalibrationRecord>>>>;

#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// Records at least this old are recomputed before use
    pub ttl: chrono::Duration,
    pub lookback_secs: u64,
    pub interval_secs: u64,
    pub min_samples: usize,
    pub fetch_timeout: std::time::Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::hours(6),
            lookback_secs: 2 * 24 * 3600,
            interval_secs: 300,
            min_samples: 30,
            fetch_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// True when `cached` may not parameterize a simulation at `now`.
/// Pure function of (record, now): periodic recalibration needs no scheduler.
#[inline]
pub fn needs_refresh(cached: Option<&CalibrationRecord>, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
    match cached {
        None => true,
        Some(record) => record.age(now) >= ttl,
    }
}

/// Per-asset drift/volatility cache with TTL expiry and single-flight recompute.
///
/// Each asset owns an async slot. The outer map lock is only held to look up
/// or insert a slot, so a slow recalibration of one asset never blocks another.
/// Concurrent callers for the same asset queue on the slot and reuse the
/// record the first one stored.
pub struct Calibrator<H> {
    source: H,
    settings: CalibrationSettings,
    store: Mutex<HashMap<AssetId, Slot>>,
    counters: Arc<EngineCounters>,
}

impl<H: HistorySource> Calibrator<H> {
    pub fn new(source: H, settings: CalibrationSettings, counters: Arc<EngineCounters>) -> Self {
        Self {
            source,
            settings,
            store: Mutex::new(HashMap::new()),
            counters,
        }
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    /// Return a fresh record for `asset`, recomputing it if missing or expired.
    /// A failed recompute leaves no usable record behind.
    pub async fn calibrate(&self, asset: &AssetId, now: DateTime<Utc>) -> EngineResult<Arc<CalibrationRecord>> {
        let slot = self.slot(asset);
        let mut cached = slot.lock().await;

        if let Some(record) = cached.as_ref() {
            if !needs_refresh(Some(record.as_ref()), now, self.settings.ttl) {
                EngineCounters::bump(&self.counters.calibration_cache_hits);
                return Ok(Arc::clone(record));
            }
        }

        let record = Arc::new(self.compute(asset, now).await?);
        EngineCounters::bump(&self.counters.calibrations_computed);

        tracing::info!(
            asset = %asset,
            drift = record.drift,
            volatility = record.volatility,
            samples = record.source_window.samples,
            "calibration recomputed"
        );

        *cached = Some(Arc::clone(&record));
        Ok(record)
    }

    fn slot(&self, asset: &AssetId) -> Slot {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(store.entry(asset.clone()).or_default())
    }

    async fn compute(&self, asset: &AssetId, now: DateTime<Utc>) -> EngineResult<CalibrationRecord> {
        let window = HistoryWindow::ending_at(now, self.settings.lookback_secs, self.settings.interval_secs);

        let raw = tokio::time::timeout(self.settings.fetch_timeout, self.source.get_history(asset, &window))
            .await
            .map_err(|_| {
                EngineError::Source(format!(
                    "history fetch for {asset} timed out after {:?}",
                    self.settings.fetch_timeout
                ))
            })??;

        let history = volatility::clean_history(raw);
        let prices: Vec<f64> = history.iter().map(|s| s.price).collect();

        let stats = volatility::estimate(&prices, self.settings.min_samples).ok_or_else(|| {
            EngineError::DataUnavailable {
                asset: asset.to_string(),
                available: prices.len(),
                required: self.settings.min_samples,
            }
        })?;

        Ok(CalibrationRecord {
            asset: asset.clone(),
            drift: stats.drift,
            volatility: stats.volatility,
            computed_at: now,
            source_window: SourceWindow {
                samples: stats.samples,
                start: history.first().map(|s| s.time),
                end: history.last().map(|s| s.time),
                interval_secs: self.settings.interval_secs,
            },
            origin: CalibrationOrigin::Historical,
        })
    }
}
