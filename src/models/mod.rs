pub mod volatility;
pub mod calibration;
pub mod random_walk;
pub mod gbm;
pub mod mean_reversion;
pub mod ensemble;

use crate::errors::{EngineError, EngineResult};
use crate::state::{seconds, PricePoint, SimulationPath};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;

/// Tag of a base simulator. Order of `ALL` is the canonical variant order
/// used for weights, allocations and tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatorKind {
    RandomWalk,
    Gbm,
    MeanReverting,
}

impl SimulatorKind {
    pub const COUNT: usize = 3;
    pub const ALL: [SimulatorKind; Self::COUNT] = [
        SimulatorKind::RandomWalk,
        SimulatorKind::Gbm,
        SimulatorKind::MeanReverting,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::RandomWalk => 0,
            Self::Gbm => 1,
            Self::MeanReverting => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RandomWalk => "random_walk",
            Self::Gbm => "gbm",
            Self::MeanReverting => "mean_reverting",
        }
    }
}

impl std::fmt::Display for SimulatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs shared by every simulator for one request.
#[derive(Debug, Clone, Copy)]
pub struct SimulationParams {
    pub start_time: DateTime<Utc>,
    pub start_price: f64,
    /// Mean log-return per calibration interval
    pub drift: f64,
    /// Std dev of log-returns per calibration interval
    pub volatility: f64,
    pub num_steps: usize,
    /// Forecast step measured in calibration intervals
    pub dt: f64,
    pub time_increment_secs: u64,
}

impl SimulationParams {
    /// Timestamps of every point, anchor first. Identical for all variants.
    /// Fails instead of wrapping when a point falls outside chrono's range.
    pub fn time_grid(&self) -> EngineResult<Vec<DateTime<Utc>>> {
        let inc = self.time_increment_secs;
        (0..=self.num_steps as u64)
            .map(|i| {
                i.checked_mul(inc)
                    .and_then(seconds)
                    .and_then(|offset| self.start_time.checked_add_signed(offset))
                    .ok_or_else(|| {
                        EngineError::InvalidRequest(format!(
                            "point {i} at {inc}s steps overflows the time range"
                        ))
                    })
            })
            .collect()
    }
}

/// Per-step constants derived once from `SimulationParams`.
#[derive(Debug, Clone, Copy)]
pub struct StepParams {
    pub drift_dt: f64,
    pub vol_sqrt_dt: f64,
    pub ln_anchor: f64,
    /// Fraction of the gap to the anchor closed per step, in [0, 1]
    pub pull: f64,
}

impl StepParams {
    #[inline]
    pub fn new(params: &SimulationParams, reversion_rate: f64) -> Self {
        let dt = params.dt.max(0.0);
        Self {
            drift_dt: params.drift * dt,
            vol_sqrt_dt: params.volatility.max(0.0) * dt.sqrt(),
            ln_anchor: params.start_price.ln(),
            pull: (reversion_rate * dt).clamp(0.0, 1.0),
        }
    }
}

/// Closed set of base simulators behind one `simulate` capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Simulator {
    RandomWalk,
    Gbm,
    MeanReverting { reversion_rate: f64 },
}

impl Simulator {
    /// One simulator per kind, in `SimulatorKind::ALL` order.
    pub fn roster(reversion_rate: f64) -> [Simulator; SimulatorKind::COUNT] {
        [
            Simulator::RandomWalk,
            Simulator::Gbm,
            Simulator::MeanReverting { reversion_rate },
        ]
    }

    #[inline]
    pub fn kind(&self) -> SimulatorKind {
        match self {
            Self::RandomWalk => SimulatorKind::RandomWalk,
            Self::Gbm => SimulatorKind::Gbm,
            Self::MeanReverting { .. } => SimulatorKind::MeanReverting,
        }
    }

    /// Draw `num_paths` independent paths. Deterministic for a given seed.
    /// Every path starts at exactly `(start_time, start_price)`.
    pub fn simulate(
        &self,
        params: &SimulationParams,
        num_paths: usize,
        seed: u64,
    ) -> EngineResult<Vec<SimulationPath>> {
        let kind = self.kind();
        let mut rng = StdRng::seed_from_u64(variant_seed(seed, kind));
        let normal = Normal::standard();
        let grid = params.time_grid()?;
        let reversion_rate = match self {
            Self::MeanReverting { reversion_rate } => *reversion_rate,
            _ => 0.0,
        };
        let step = StepParams::new(params, reversion_rate);

        let mut paths = Vec::with_capacity(num_paths);
        for _ in 0..num_paths {
            let mut points = Vec::with_capacity(grid.len());
            let mut price = params.start_price;
            points.push(PricePoint { time: grid[0], price });

            for &time in &grid[1..] {
                price = match self {
                    Self::RandomWalk => random_walk::step(price, &step, &normal, &mut rng),
                    Self::Gbm => gbm::step(price, &step, &normal, &mut rng),
                    Self::MeanReverting { .. } => mean_reversion::step(price, &step, &normal, &mut rng),
                };
                points.push(PricePoint { time, price });
            }

            paths.push(SimulationPath { variant: kind, points });
        }
        Ok(paths)
    }
}

/// Independent stream per variant so pools never share draws.
#[inline]
pub fn variant_seed(seed: u64, kind: SimulatorKind) -> u64 {
    seed ^ (kind.index() as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
