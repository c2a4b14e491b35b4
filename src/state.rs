use crate::errors::{EngineError, EngineResult};
use crate::models::SimulatorKind;
use chrono::{DateTime, Utc};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ── Asset identifier ──

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Calibration ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationOrigin {
    /// Estimated from the historical window
    Historical,
    /// Configured fallback used when history was too short
    Prior,
}

impl std::fmt::Display for CalibrationOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Historical => write!(f, "historical"),
            Self::Prior => write!(f, "prior"),
        }
    }
}

/// The slice of history a calibration was computed from.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct SourceWindow {
    pub samples: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Spacing of the history samples. Drift and volatility are per this interval.
    pub interval_secs: u64,
}

/// Immutable per-asset drift/volatility estimate.
/// Superseded by the next recalibration, never mutated.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CalibrationRecord {
    pub asset: AssetId,
    /// Mean log-return per sample interval
    pub drift: f64,
    /// Standard deviation of log-returns per sample interval
    pub volatility: f64,
    pub computed_at: DateTime<Utc>,
    pub source_window: SourceWindow,
    pub origin: CalibrationOrigin,
}

impl CalibrationRecord {
    /// Record built from the configured prior, used when history is insufficient.
    pub fn prior(
        asset: AssetId,
        drift: f64,
        volatility: f64,
        interval_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            asset,
            drift,
            volatility,
            computed_at: now,
            source_window: SourceWindow {
                samples: 0,
                start: None,
                end: None,
                interval_secs,
            },
            origin: CalibrationOrigin::Prior,
        }
    }

    /// Age of the record at `now`. Negative when `computed_at` is in the future.
    #[inline]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.computed_at
    }
}

// ── Paths and bundles ──

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PricePoint {
    pub time: DateTime<Utc>,
    pub price: f64,
}

/// One simulated trajectory on the request's time grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationPath {
    /// Variant that produced the path; paths are never blended
    pub variant: SimulatorKind,
    pub points: Vec<PricePoint>,
}

impl SimulationPath {
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn first(&self) -> Option<&PricePoint> {
        self.points.first()
    }

    #[cfg(test)]
    pub fn prices(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.price)
    }
}

#[derive(Debug, Clone)]
pub struct SimulationBundle {
    pub asset: AssetId,
    pub paths: Vec<SimulationPath>,
}

impl SimulationBundle {
    #[cfg(test)]
    pub fn count_of(&self, kind: SimulatorKind) -> usize {
        self.paths.iter().filter(|p| p.variant == kind).count()
    }
}

// ── Requests ──

/// Request as received from the request-handling layer.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SimulationInput {
    pub asset: String,
    pub num_simulations: usize,
    pub time_increment_seconds: u64,
    pub time_length_seconds: u64,
    /// Anchor time of the first point; defaults to the time of the call
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

/// Fully resolved, immutable forecast request.
#[derive(Debug, Clone)]
pub struct ForecastRequest {
    asset: AssetId,
    start_time: DateTime<Utc>,
    start_price: f64,
    num_simulations: usize,
    time_increment_secs: u64,
    horizon_secs: u64,
}

impl ForecastRequest {
    pub fn new(
        asset: AssetId,
        start_time: DateTime<Utc>,
        start_price: f64,
        num_simulations: usize,
        time_increment_secs: u64,
        horizon_secs: u64,
    ) -> EngineResult<Self> {
        validate_grid(num_simulations, time_increment_secs, horizon_secs)?;
        let end = seconds(horizon_secs).and_then(|h| start_time.checked_add_signed(h));
        if end.is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "horizon of {horizon_secs}s from {} is outside the representable time range",
                start_time.to_rfc3339()
            )));
        }
        if !start_price.is_finite() || start_price <= 0.0 {
            return Err(EngineError::InvalidRequest(format!(
                "start price must be positive and finite, got {start_price}"
            )));
        }
        Ok(Self {
            asset,
            start_time,
            start_price,
            num_simulations,
            time_increment_secs,
            horizon_secs,
        })
    }

    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn start_price(&self) -> f64 {
        self.start_price
    }

    pub fn num_simulations(&self) -> usize {
        self.num_simulations
    }

    pub fn time_increment_secs(&self) -> u64 {
        self.time_increment_secs
    }

    pub fn horizon_secs(&self) -> u64 {
        self.horizon_secs
    }

    /// Number of steps after the anchor point.
    #[inline]
    pub fn num_steps(&self) -> usize {
        (self.horizon_secs / self.time_increment_secs) as usize
    }

    /// Points per path, anchor included.
    #[inline]
    pub fn expected_points(&self) -> usize {
        self.num_steps() + 1
    }
}

/// Reject grids that cannot produce a well-formed bundle.
pub fn validate_grid(
    num_simulations: usize,
    time_increment_secs: u64,
    horizon_secs: u64,
) -> EngineResult<()> {
    if num_simulations == 0 {
        return Err(EngineError::InvalidRequest("num_simulations must be > 0".into()));
    }
    if time_increment_secs == 0 {
        return Err(EngineError::InvalidRequest("time_increment must be > 0".into()));
    }
    if horizon_secs == 0 || horizon_secs % time_increment_secs != 0 {
        return Err(EngineError::InvalidRequest(format!(
            "time_length {horizon_secs}s must be a positive multiple of time_increment {time_increment_secs}s"
        )));
    }
    if seconds(horizon_secs).is_none() {
        return Err(EngineError::InvalidRequest(format!(
            "time_length {horizon_secs}s is out of range"
        )));
    }
    Ok(())
}

/// Reject grids larger than the configured caps.
pub fn validate_grid_size(
    num_simulations: usize,
    num_steps: u64,
    max_steps: u64,
    max_points: u64,
) -> EngineResult<()> {
    if num_steps > max_steps {
        return Err(EngineError::InvalidRequest(format!(
            "{num_steps} steps per path exceeds the limit of {max_steps}"
        )));
    }
    let points = (num_simulations as u64).checked_mul(num_steps + 1);
    match points {
        Some(p) if p <= max_points => Ok(()),
        _ => Err(EngineError::InvalidRequest(format!(
            "{num_simulations} paths x {} points exceeds the limit of {max_points} points",
            num_steps + 1
        ))),
    }
}

/// `secs` as a chrono duration; None when it does not fit.
#[inline]
pub fn seconds(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

// ── Response ──

#[derive(Debug, Clone, serde::Serialize)]
pub struct CalibrationSummary {
    pub drift: f64,
    pub volatility: f64,
    pub origin: CalibrationOrigin,
    pub computed_at: DateTime<Utc>,
    pub samples: usize,
}

impl From<&CalibrationRecord> for CalibrationSummary {
    fn from(r: &CalibrationRecord) -> Self {
        Self {
            drift: r.drift,
            volatility: r.volatility,
            origin: r.origin,
            computed_at: r.computed_at,
            samples: r.source_window.samples,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct VariantAllocation {
    pub variant: SimulatorKind,
    pub paths: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ForecastMetadata {
    pub request_id: uuid::Uuid,
    pub model: &'static str,
    pub seed: u64,
    pub latency_ms: f64,
    pub calibration: CalibrationSummary,
    pub allocation: Vec<VariantAllocation>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ForecastResponse {
    pub asset: AssetId,
    pub start_time: DateTime<Utc>,
    pub start_price: f64,
    pub time_increment: u64,
    pub time_length: u64,
    pub num_simulations: usize,
    pub metadata: ForecastMetadata,
    pub paths: Vec<Vec<PricePoint>>,
}

// ── Performance Counters (lock-free) ──

pub struct EngineCounters {
    pub forecasts_requested: AtomicU64,
    pub forecasts_succeeded: AtomicU64,
    pub forecasts_failed: AtomicU64,
    pub calibrations_computed: AtomicU64,
    pub calibration_cache_hits: AtomicU64,
    pub prior_fallbacks: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            forecasts_requested: AtomicU64::new(0),
            forecasts_succeeded: AtomicU64::new(0),
            forecasts_failed: AtomicU64::new(0),
            calibrations_computed: AtomicU64::new(0),
            calibration_cache_hits: AtomicU64::new(0),
            prior_fallbacks: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        use Ordering::Relaxed;
        CounterSnapshot {
            forecasts_requested: self.forecasts_requested.load(Relaxed),
            forecasts_succeeded: self.forecasts_succeeded.load(Relaxed),
            forecasts_failed: self.forecasts_failed.load(Relaxed),
            calibrations_computed: self.calibrations_computed.load(Relaxed),
            calibration_cache_hits: self.calibration_cache_hits.load(Relaxed),
            prior_fallbacks: self.prior_fallbacks.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub forecasts_requested: u64,
    pub forecasts_succeeded: u64,
    pub forecasts_failed: u64,
    pub calibrations_computed: u64,
    pub calibration_cache_hits: u64,
    pub prior_fallbacks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_points_default_grid() {
        let req = ForecastRequest::new(
            AssetId::from("BTC"),
            Utc::now(),
            50_000.0,
            10,
            300,
            86_400,
        )
        .unwrap();
        assert_eq!(req.num_steps(), 288);
        assert_eq!(req.expected_points(), 289);
    }

    #[test]
    fn test_rejects_bad_grid() {
        assert!(validate_grid(0, 300, 86_400).is_err());
        assert!(validate_grid(10, 0, 86_400).is_err());
        assert!(validate_grid(10, 300, 1_000).is_err());
        assert!(validate_grid(10, 300, 0).is_err());
        assert!(validate_grid(10, 300, 600).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        assert_eq!(validate_grid(10, u64::MAX, u64::MAX).unwrap_err().reason_code(), "INVALID_REQUEST");
        assert!(validate_grid(10, 1 << 62, 1 << 62).is_err());
        assert!(seconds(u64::MAX).is_none());
        assert_eq!(seconds(300), Some(chrono::Duration::seconds(300)));
    }

    #[test]
    fn test_rejects_horizon_past_time_range() {
        let t0 = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 6, 1, 12, 0, 0).unwrap();
        let huge = 10_000_000_000_000;
        assert!(validate_grid(10, huge, huge).is_ok());
        let err = ForecastRequest::new(AssetId::from("BTC"), t0, 50_000.0, 10, huge, huge).unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_grid_size_caps() {
        assert!(validate_grid_size(100, 288, 100_000, 10_000_000).is_ok());
        assert!(validate_grid_size(1, 100_001, 100_000, u64::MAX).is_err());
        assert!(validate_grid_size(10_000, 1_000, 100_000, 10_000_000).is_err());
        assert!(validate_grid_size(usize::MAX, u64::MAX - 1, u64::MAX, u64::MAX).is_err());
    }

    #[test]
    fn test_rejects_non_positive_start_price() {
        let now = Utc::now();
        let err = ForecastRequest::new(AssetId::from("ETH"), now, 0.0, 10, 300, 3_600).unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_REQUEST");
        assert!(ForecastRequest::new(AssetId::from("ETH"), now, f64::NAN, 10, 300, 3_600).is_err());
    }

    #[test]
    fn test_record_age() {
        let now = Utc::now();
        let rec = CalibrationRecord::prior(AssetId::from("SOL"), 0.0, 0.002, 300, now);
        assert_eq!(rec.age(now + chrono::Duration::hours(2)), chrono::Duration::hours(2));
        assert_eq!(rec.origin, CalibrationOrigin::Prior);
    }
}
