use crate::bundle;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::feeds::{HistorySource, PriceSource};
use crate::models::calibration::Calibrator;
use crate::models::ensemble::{self, WeightVector};
use crate::models::{SimulationParams, Simulator, SimulatorKind};
use crate::state::*;
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Identifier reported in every response.
pub const MODEL_ID: &str = "ensemble-gbm-weighted";

/// Forecasting engine: calibrate -> simulate -> aggregate -> validate.
///
/// Owns the calibration store; everything else is per request. Requests are
/// independent and may run concurrently on a shared `&ForecastEngine`.
pub struct ForecastEngine<P, H> {
    config: EngineConfig,
    prices: P,
    calibrator: Calibrator<H>,
    simulators: [Simulator; SimulatorKind::COUNT],
    counters: Arc<EngineCounters>,
}

impl<P: PriceSource, H: HistorySource> ForecastEngine<P, H> {
    pub fn new(config: EngineConfig, prices: P, history: H) -> EngineResult<Self> {
        config.validate()?;
        let counters = EngineCounters::new();
        let calibrator = Calibrator::new(history, config.calibration.clone(), Arc::clone(&counters));
        let simulators = Simulator::roster(config.reversion_rate);
        Ok(Self {
            config,
            prices,
            calibrator,
            simulators,
            counters,
        })
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Entry point for the request-handling layer.
    pub async fn generate_forecast(&self, input: &SimulationInput) -> EngineResult<ForecastResponse> {
        self.generate_forecast_at(input, Utc::now()).await
    }

    /// Same as `generate_forecast` with an explicit clock.
    pub async fn generate_forecast_at(
        &self,
        input: &SimulationInput,
        now: DateTime<Utc>,
    ) -> EngineResult<ForecastResponse> {
        EngineCounters::bump(&self.counters.forecasts_requested);
        let started = Instant::now();

        let result = self.run(input, now, started).await;

        match &result {
            Ok(resp) => {
                EngineCounters::bump(&self.counters.forecasts_succeeded);
                tracing::info!(
                    asset = %resp.asset,
                    paths = resp.paths.len(),
                    points = resp.paths.first().map_or(0, |p| p.len()),
                    latency_ms = resp.metadata.latency_ms,
                    calibration = %resp.metadata.calibration.origin,
                    "forecast generated"
                );
            }
            Err(e) => {
                EngineCounters::bump(&self.counters.forecasts_failed);
                tracing::warn!(asset = %input.asset, reason = e.reason_code(), error = %e, "forecast failed");
            }
        }

        result
    }

    async fn run(
        &self,
        input: &SimulationInput,
        now: DateTime<Utc>,
        started: Instant,
    ) -> EngineResult<ForecastResponse> {
        validate_grid(input.num_simulations, input.time_increment_seconds, input.time_length_seconds)?;
        validate_grid_size(
            input.num_simulations,
            input.time_length_seconds / input.time_increment_seconds,
            self.config.max_steps,
            self.config.max_grid_points,
        )?;

        // Opaque id: passed through to the sources and the response unchanged
        if input.asset.trim().is_empty() {
            return Err(EngineError::InvalidRequest("asset is empty".into()));
        }
        let asset = AssetId::new(input.asset.as_str());

        let start_price = self.quote(&asset).await?;
        let request = ForecastRequest::new(
            asset,
            input.start_time.unwrap_or_else(|| now.trunc_subsecs(0)),
            start_price,
            input.num_simulations,
            input.time_increment_seconds,
            input.time_length_seconds,
        )?;

        let calibration = self.calibration_for(request.asset(), now).await?;
        let weights = self.config.weights.select(&calibration);
        let seed = self.config.seed.unwrap_or_else(rand::random::<u64>);

        let (bundle, counts) = self.simulate_bundle(&request, &calibration, &weights, seed)?;

        let metadata = ForecastMetadata {
            request_id: uuid::Uuid::new_v4(),
            model: MODEL_ID,
            seed,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            calibration: CalibrationSummary::from(calibration.as_ref()),
            allocation: SimulatorKind::ALL
                .iter()
                .map(|k| VariantAllocation { variant: *k, paths: counts[k.index()] })
                .collect(),
        };

        bundle::format_and_validate(bundle, &request, metadata)
    }

    /// Anchor price, bounded by the price timeout.
    async fn quote(&self, asset: &AssetId) -> EngineResult<f64> {
        let price = tokio::time::timeout(self.config.price_timeout, self.prices.get_price(asset))
            .await
            .map_err(|_| {
                EngineError::Source(format!(
                    "price quote for {asset} timed out after {:?}",
                    self.config.price_timeout
                ))
            })??;

        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::Source(format!("invalid quote for {asset}: {price}")));
        }
        Ok(price)
    }

    /// Cached or recomputed calibration; short history falls back to the prior.
    async fn calibration_for(&self, asset: &AssetId, now: DateTime<Utc>) -> EngineResult<Arc<CalibrationRecord>> {
        match self.calibrator.calibrate(asset, now).await {
            Ok(record) => Ok(record),
            Err(EngineError::DataUnavailable { available, required, .. }) => {
                EngineCounters::bump(&self.counters.prior_fallbacks);
                tracing::warn!(
                    asset = %asset,
                    available,
                    required,
                    "insufficient history, using prior calibration"
                );
                Ok(Arc::new(CalibrationRecord::prior(
                    asset.clone(),
                    self.config.prior_drift,
                    self.config.prior_volatility,
                    self.calibrator.settings().interval_secs,
                    now,
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Pure simulation stage: one pool per variant sized to its allocation,
    /// then aggregation. Deterministic for a given seed.
    pub fn simulate_bundle(
        &self,
        request: &ForecastRequest,
        calibration: &CalibrationRecord,
        weights: &WeightVector,
        seed: u64,
    ) -> EngineResult<(SimulationBundle, [usize; SimulatorKind::COUNT])> {
        let counts = ensemble::allocate(weights, request.num_simulations())?;

        let interval = calibration.source_window.interval_secs.max(1) as f64;
        let params = SimulationParams {
            start_time: request.start_time(),
            start_price: request.start_price(),
            drift: calibration.drift,
            volatility: calibration.volatility,
            num_steps: request.num_steps(),
            dt: request.time_increment_secs() as f64 / interval,
            time_increment_secs: request.time_increment_secs(),
        };

        let mut pools: [Vec<SimulationPath>; SimulatorKind::COUNT] = Default::default();
        for sim in &self.simulators {
            let idx = sim.kind().index();
            pools[idx] = sim.simulate(&params, counts[idx], seed)?;
        }

        let bundle = ensemble::aggregate(request.asset(), pools, weights, request.num_simulations())?;
        Ok((bundle, counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::FeedError;
    use crate::models::calibration::tests::{t0, MockHistory};
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct MockPrice {
        price: Option<f64>,
        delay: std::time::Duration,
        calls: Arc<AtomicUsize>,
    }

    impl MockPrice {
        fn fixed(price: f64) -> Self {
            Self {
                price: Some(price),
                delay: std::time::Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl PriceSource for MockPrice {
        async fn get_price(&self, _asset: &AssetId) -> Result<f64, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.price.ok_or_else(|| FeedError::Unavailable("no quote".into()))
        }
    }

    fn seeded() -> EngineConfig {
        EngineConfig { seed: Some(42), ..EngineConfig::default() }
    }

    fn btc_input(n: usize) -> SimulationInput {
        SimulationInput {
            asset: "BTC".into(),
            num_simulations: n,
            time_increment_seconds: 300,
            time_length_seconds: 86_400,
            start_time: Some(t0()),
        }
    }

    #[tokio::test]
    async fn test_btc_scenario() {
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), MockHistory::with_samples(200)).unwrap();

        let resp = engine.generate_forecast_at(&btc_input(10), t0()).await.unwrap();

        assert_eq!(resp.paths.len(), 10);
        for path in &resp.paths {
            assert_eq!(path.len(), 289);
            assert_eq!(path[0].time, t0());
            assert_eq!(path[0].price, 50_000.0);
            for w in path.windows(2) {
                assert_eq!(w[1].time - w[0].time, chrono::Duration::seconds(300));
            }
            assert!(path.iter().all(|p| p.price > 0.0));
        }
        assert_eq!(resp.metadata.model, MODEL_ID);
        assert_eq!(resp.metadata.seed, 42);
        assert_eq!(resp.metadata.allocation.iter().map(|a| a.paths).sum::<usize>(), 10);
        assert_eq!(resp.metadata.calibration.origin, CalibrationOrigin::Historical);
        assert_eq!(engine.counters().forecasts_succeeded, 1);
    }

    #[tokio::test]
    async fn test_short_history_falls_back_to_prior() {
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), MockHistory::with_samples(2)).unwrap();

        let resp = engine.generate_forecast_at(&btc_input(10), t0()).await.unwrap();

        assert_eq!(resp.paths.len(), 10);
        assert_eq!(resp.metadata.calibration.origin, CalibrationOrigin::Prior);
        assert_eq!(resp.metadata.calibration.volatility, EngineConfig::default().prior_volatility);
        let counters = engine.counters();
        assert_eq!(counters.prior_fallbacks, 1);
        assert_eq!(counters.forecasts_failed, 0);
    }

    #[tokio::test]
    async fn test_price_timeout_is_source_error() {
        let mut prices = MockPrice::fixed(50_000.0);
        prices.delay = std::time::Duration::from_millis(300);
        let config = EngineConfig {
            price_timeout: std::time::Duration::from_millis(20),
            ..seeded()
        };
        let engine = ForecastEngine::new(config, prices, MockHistory::with_samples(200)).unwrap();

        let err = engine.generate_forecast_at(&btc_input(10), t0()).await.unwrap_err();
        assert_eq!(err.reason_code(), "SOURCE_ERROR");
        assert_eq!(engine.counters().forecasts_failed, 1);
    }

    #[tokio::test]
    async fn test_price_unavailable() {
        let prices = MockPrice { price: None, ..MockPrice::fixed(0.0) };
        let engine = ForecastEngine::new(seeded(), prices, MockHistory::with_samples(200)).unwrap();
        let err = engine.generate_forecast_at(&btc_input(5), t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::Source(_)));
    }

    #[tokio::test]
    async fn test_history_outage_is_not_masked_by_prior() {
        let mut history = MockHistory::with_samples(200);
        history.fail = true;
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(3_000.0), history).unwrap();
        let err = engine.generate_forecast_at(&btc_input(5), t0()).await.unwrap_err();
        assert_eq!(err.reason_code(), "SOURCE_ERROR");
        assert_eq!(engine.counters().prior_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_quote() {
        let prices = MockPrice::fixed(50_000.0);
        let engine = ForecastEngine::new(seeded(), prices.clone(), MockHistory::with_samples(200)).unwrap();

        let mut input = btc_input(0);
        let err = engine.generate_forecast_at(&input, t0()).await.unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_REQUEST");

        input.num_simulations = 10;
        input.time_length_seconds = 1_000;
        assert!(engine.generate_forecast_at(&input, t0()).await.is_err());
        assert_eq!(prices.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_same_seed_same_bundle() {
        let a = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), MockHistory::with_samples(200)).unwrap();
        let b = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), MockHistory::with_samples(200)).unwrap();

        let ra = a.generate_forecast_at(&btc_input(20), t0()).await.unwrap();
        let rb = b.generate_forecast_at(&btc_input(20), t0()).await.unwrap();
        assert_eq!(ra.paths, rb.paths);
        assert_ne!(ra.metadata.request_id, rb.metadata.request_id);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_calibration() {
        let mut history = MockHistory::with_samples(200);
        history.delay = std::time::Duration::from_millis(30);
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), history.clone()).unwrap();

        let input = btc_input(10);
        let results = join_all((0..5).map(|_| engine.generate_forecast_at(&input, t0()))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(history.calls(), 1);
        let counters = engine.counters();
        assert_eq!(counters.calibrations_computed, 1);
        assert_eq!(counters.forecasts_succeeded, 5);
    }

    #[tokio::test]
    async fn test_recalibrates_after_ttl() {
        let history = MockHistory::with_samples(200);
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), history.clone()).unwrap();

        let input = btc_input(5);
        engine.generate_forecast_at(&input, t0()).await.unwrap();
        engine.generate_forecast_at(&input, t0() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(history.calls(), 1);

        let resp = engine.generate_forecast_at(&input, t0() + chrono::Duration::hours(6)).await.unwrap();
        assert_eq!(history.calls(), 2);
        assert_eq!(resp.metadata.calibration.computed_at, t0() + chrono::Duration::hours(6));
    }

    #[tokio::test]
    async fn test_default_start_time_is_call_time() {
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(1.5), MockHistory::with_samples(200)).unwrap();
        let mut input = btc_input(3);
        input.start_time = None;
        input.time_length_seconds = 3_600;

        let now = t0() + chrono::Duration::milliseconds(750);
        let resp = engine.generate_forecast_at(&input, now).await.unwrap();
        assert_eq!(resp.start_time, t0());
        assert_eq!(resp.paths[0].len(), 13);
    }

    #[tokio::test]
    async fn test_grid_beyond_time_range_is_rejected() {
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), MockHistory::with_samples(200)).unwrap();

        let mut input = btc_input(10);
        input.time_increment_seconds = 10_000_000_000_000;
        input.time_length_seconds = 10_000_000_000_000;
        let err = engine.generate_forecast_at(&input, t0()).await.unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_REQUEST");
        assert_eq!(engine.counters().forecasts_failed, 1);
    }

    #[tokio::test]
    async fn test_wrapping_increment_never_yields_backward_path() {
        let config = EngineConfig { prior_volatility: 0.0, ..seeded() };
        let engine = ForecastEngine::new(config, MockPrice::fixed(50_000.0), MockHistory::with_samples(2)).unwrap();

        let mut input = btc_input(10);
        input.time_increment_seconds = u64::MAX;
        input.time_length_seconds = u64::MAX;
        let err = engine.generate_forecast_at(&input, t0()).await.unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_oversized_grid_is_rejected_before_quote() {
        let prices = MockPrice::fixed(50_000.0);
        let config = EngineConfig { max_grid_points: 1_000, ..seeded() };
        let engine = ForecastEngine::new(config, prices.clone(), MockHistory::with_samples(200)).unwrap();

        // 10 x 289 points
        let err = engine.generate_forecast_at(&btc_input(10), t0()).await.unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_REQUEST");

        let mut input = btc_input(1);
        input.time_increment_seconds = 1;
        input.time_length_seconds = 200_000;
        assert!(engine.generate_forecast_at(&input, t0()).await.is_err());
        assert_eq!(prices.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_asset_id_passed_through_unchanged() {
        let engine = ForecastEngine::new(seeded(), MockPrice::fixed(50_000.0), MockHistory::with_samples(200)).unwrap();

        let mut input = btc_input(3);
        input.asset = "btc".into();
        let lower = engine.generate_forecast_at(&input, t0()).await.unwrap();
        assert_eq!(lower.asset, AssetId::from("btc"));

        engine.generate_forecast_at(&btc_input(3), t0()).await.unwrap();
        // distinct ids get distinct calibration slots
        assert_eq!(engine.counters().calibrations_computed, 2);

        input.asset = "   ".into();
        let err = engine.generate_forecast_at(&input, t0()).await.unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_response_serializes_to_time_price_points() {
        let point = PricePoint { time: t0(), price: 50_000.0 };
        let json = serde_json::to_value(point).unwrap();
        assert_eq!(json["time"], "2025-06-01T12:00:00Z");
        assert_eq!(json["price"], 50_000.0);
    }
}
