use crate::errors::{EngineError, EngineResult};
use crate::models::calibration::CalibrationSettings;
use crate::models::ensemble::{WeightPolicy, WeightVector};
use crate::state::AssetId;
use std::str::FromStr;
use std::time::Duration;

/// Engine parameters. `Default` carries the design defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub calibration: CalibrationSettings,
    /// Fallback drift per calibration interval when history is too short
    pub prior_drift: f64,
    /// Fallback volatility per calibration interval when history is too short
    pub prior_volatility: f64,
    pub weights: WeightPolicy,
    /// Mean-reversion speed per calibration interval
    pub reversion_rate: f64,
    pub price_timeout: Duration,
    /// Fixed seed for reproducible bundles; random per request when None
    pub seed: Option<u64>,
    /// Largest accepted time_length / time_increment
    pub max_steps: u64,
    /// Largest accepted num_simulations * points per path
    pub max_grid_points: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            calibration: CalibrationSettings::default(),
            prior_drift: 0.0,
            prior_volatility: 0.002,
            weights: WeightPolicy::default(),
            reversion_rate: 0.1,
            price_timeout: Duration::from_secs(10),
            seed: None,
            max_steps: 100_000,
            max_grid_points: 10_000_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        self.weights.validate()?;
        if !self.prior_volatility.is_finite() || self.prior_volatility < 0.0 {
            return Err(EngineError::Config(format!(
                "PRIOR_VOLATILITY must be non-negative, got {}",
                self.prior_volatility
            )));
        }
        if !self.prior_drift.is_finite() {
            return Err(EngineError::Config("PRIOR_DRIFT must be finite".into()));
        }
        if !self.reversion_rate.is_finite() || self.reversion_rate < 0.0 {
            return Err(EngineError::Config(format!(
                "REVERSION_RATE must be non-negative, got {}",
                self.reversion_rate
            )));
        }
        if self.max_steps == 0 || self.max_grid_points == 0 {
            return Err(EngineError::Config("MAX_STEPS and MAX_GRID_POINTS must be > 0".into()));
        }
        if self.calibration.interval_secs == 0 {
            return Err(EngineError::Config("HISTORY_INTERVAL_SECS must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub assets: Vec<AssetId>,
    pub num_simulations: usize,
    pub time_increment_secs: u64,
    pub time_length_secs: u64,
    pub price_api_base_url: String,
    pub history_api_base_url: String,
    /// 0 runs a single pass
    pub forecast_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let source_timeout = Duration::from_secs(parse_var("SOURCE_TIMEOUT_SECS", "10")?);

        let calm = parse_weights(&env_var_or("ENSEMBLE_WEIGHTS", "0.2,0.5,0.3"))
            .map_err(|e| EngineError::Config(format!("ENSEMBLE_WEIGHTS: {e}")))?;
        let weights = match std::env::var("TURBULENT_WEIGHTS") {
            Ok(raw) => WeightPolicy::Regime {
                calm,
                turbulent: parse_weights(&raw)
                    .map_err(|e| EngineError::Config(format!("TURBULENT_WEIGHTS: {e}")))?,
                vol_threshold: parse_var("TURBULENT_VOL_THRESHOLD", "0.01")?,
            },
            Err(_) => WeightPolicy::Fixed(calm),
        };

        let seed = match std::env::var("SIMULATION_SEED") {
            Ok(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|e| EngineError::Config(format!("SIMULATION_SEED: {e}")))?,
            ),
            Err(_) => None,
        };

        let engine = EngineConfig {
            calibration: CalibrationSettings {
                ttl: chrono::Duration::seconds(parse_var("CALIBRATION_TTL_SECS", "21600")?),
                lookback_secs: parse_var("HISTORY_LOOKBACK_SECS", "172800")?,
                interval_secs: parse_var("HISTORY_INTERVAL_SECS", "300")?,
                min_samples: parse_var("MIN_HISTORY_SAMPLES", "30")?,
                fetch_timeout: source_timeout,
            },
            prior_drift: parse_var("PRIOR_DRIFT", "0.0")?,
            prior_volatility: parse_var("PRIOR_VOLATILITY", "0.002")?,
            weights,
            reversion_rate: parse_var("REVERSION_RATE", "0.1")?,
            price_timeout: source_timeout,
            seed,
            max_steps: parse_var("MAX_STEPS", "100000")?,
            max_grid_points: parse_var("MAX_GRID_POINTS", "10000000")?,
        };
        engine.validate()?;

        let assets = parse_assets(&env_var_or("ASSETS", "BTC,ETH"));
        if assets.is_empty() {
            return Err(EngineError::Config("ASSETS is empty".into()));
        }

        Ok(Self {
            engine,
            assets,
            num_simulations: parse_var("NUM_SIMULATIONS", "100")?,
            time_increment_secs: parse_var("TIME_INCREMENT_SECS", "300")?,
            time_length_secs: parse_var("TIME_LENGTH_SECS", "86400")?,
            price_api_base_url: env_var_or("PRICE_API_BASE_URL", "http://127.0.0.1:8080/v1"),
            history_api_base_url: env_var_or("HISTORY_API_BASE_URL", "http://127.0.0.1:8080/v1"),
            forecast_interval_secs: parse_var("FORECAST_INTERVAL_SECS", "0")?,
        })
    }
}

/// "0.2,0.5,0.3" -> weights in random-walk, GBM, mean-reverting order.
pub fn parse_weights(raw: &str) -> EngineResult<WeightVector> {
    let values = raw
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|e| EngineError::Config(format!("bad weight {v:?}: {e}")))
        })
        .collect::<EngineResult<Vec<f64>>>()?;
    WeightVector::from_slice(&values)
}

pub fn parse_assets(raw: &str) -> Vec<AssetId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| AssetId::new(s.to_uppercase()))
        .collect()
}

fn parse_var<T>(key: &str, default: &str) -> EngineResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var_or(key, default)
        .parse::<T>()
        .map_err(|e| EngineError::Config(format!("{key}: {e}")))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
