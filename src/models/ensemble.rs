use crate::errors::{EngineError, EngineResult};
use crate::models::SimulatorKind;
use crate::state::{AssetId, CalibrationRecord, SimulationBundle, SimulationPath};

/// Weights must sum to 1 within this tolerance
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Non-negative per-variant weights summing to 1, indexed by `SimulatorKind::index`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct WeightVector(pub [f64; SimulatorKind::COUNT]);

impl WeightVector {
    pub fn new(random_walk: f64, gbm: f64, mean_reverting: f64) -> EngineResult<Self> {
        let w = Self([random_walk, gbm, mean_reverting]);
        w.validate()?;
        Ok(w)
    }

    /// Weights in `SimulatorKind::ALL` order.
    pub fn from_slice(values: &[f64]) -> EngineResult<Self> {
        match values {
            [rw, gbm, mr] => Self::new(*rw, *gbm, *mr),
            _ => Err(EngineError::InvalidWeights(format!(
                "expected {} weights, got {}",
                SimulatorKind::COUNT,
                values.len()
            ))),
        }
    }

    #[inline]
    pub fn get(&self, kind: SimulatorKind) -> f64 {
        self.0[kind.index()]
    }

    pub fn validate(&self) -> EngineResult<()> {
        for kind in SimulatorKind::ALL {
            let w = self.get(kind);
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::InvalidWeights(format!("{kind} weight is {w}")));
            }
        }
        let sum: f64 = self.0.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EngineError::InvalidWeights(format!("weights sum to {sum}, expected 1")));
        }
        Ok(())
    }

    /// Variants by descending weight; ties keep `SimulatorKind::ALL` order.
    pub fn by_weight_desc(&self) -> [SimulatorKind; SimulatorKind::COUNT] {
        let mut order = SimulatorKind::ALL;
        order.sort_by(|a, b| self.get(*b).total_cmp(&self.get(*a)));
        order
    }
}

impl Default for WeightVector {
    /// GBM-weighted ensemble
    fn default() -> Self {
        Self([0.2, 0.5, 0.3])
    }
}

/// How the ensemble weights are chosen for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightPolicy {
    Fixed(WeightVector),
    /// Switch to `turbulent` when calibrated volatility exceeds `vol_threshold`
    Regime {
        calm: WeightVector,
        turbulent: WeightVector,
        vol_threshold: f64,
    },
}

impl WeightPolicy {
    pub fn select(&self, calibration: &CalibrationRecord) -> WeightVector {
        match self {
            Self::Fixed(w) => *w,
            Self::Regime { calm, turbulent, vol_threshold } => {
                if calibration.volatility > *vol_threshold {
                    *turbulent
                } else {
                    *calm
                }
            }
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self::Fixed(w) => w.validate(),
            Self::Regime { calm, turbulent, vol_threshold } => {
                calm.validate()?;
                turbulent.validate()?;
                if !vol_threshold.is_finite() || *vol_threshold < 0.0 {
                    return Err(EngineError::InvalidWeights(format!(
                        "regime threshold must be non-negative, got {vol_threshold}"
                    )));
                }
                Ok(())
            }
        }
    }
}

impl Default for WeightPolicy {
    fn default() -> Self {
        Self::Fixed(WeightVector::default())
    }
}

/// Paths per variant: round(w_i * n), with the residual taken up (or given
/// back) by variants in descending weight order. Always sums to exactly `n`.
pub fn allocate(weights: &WeightVector, n: usize) -> EngineResult<[usize; SimulatorKind::COUNT]> {
    weights.validate()?;

    let mut counts = [0usize; SimulatorKind::COUNT];
    for kind in SimulatorKind::ALL {
        counts[kind.index()] = (weights.get(kind) * n as f64).round() as usize;
    }

    let total: usize = counts.iter().sum();
    let order = weights.by_weight_desc();

    if total < n {
        counts[order[0].index()] += n - total;
    } else {
        let mut excess = total - n;
        for kind in order {
            if excess == 0 {
                break;
            }
            let take = excess.min(counts[kind.index()]);
            counts[kind.index()] -= take;
            excess -= take;
        }
    }

    Ok(counts)
}

/// Build the bundle by taking each variant's allocation wholesale from its pool.
/// Paths are never blended across variants.
pub fn aggregate(
    asset: &AssetId,
    pools: [Vec<SimulationPath>; SimulatorKind::COUNT],
    weights: &WeightVector,
    num_simulations: usize,
) -> EngineResult<SimulationBundle> {
    let counts = allocate(weights, num_simulations)?;

    for kind in SimulatorKind::ALL {
        let (needed, available) = (counts[kind.index()], pools[kind.index()].len());
        if available < needed {
            return Err(EngineError::PoolExhausted {
                variant: kind.name(),
                needed,
                available,
            });
        }
    }

    let mut paths = Vec::with_capacity(num_simulations);
    for (idx, pool) in pools.into_iter().enumerate() {
        paths.extend(pool.into_iter().take(counts[idx]));
    }

    Ok(SimulationBundle {
        asset: asset.clone(),
        paths,
    })
}
