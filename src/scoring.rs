//! Continuous Ranked Probability Score for simulation bundles.
//!
//! For an ensemble x_1..x_m and observation y:
//!
//! CRPS = (1/m) * sum |x_i - y|  -  (1/(2 m^2)) * sum_i sum_j |x_i - x_j|
//!
//! The double sum is evaluated exactly in O(m log m) on sorted members:
//! sum_i sum_j |x_i - x_j| = 2 * sum_k (2k - m + 1) * x_(k), k = 0..m-1.
//!
//! Lower is better. All functions are pure.

use crate::errors::{EngineError, EngineResult};
use crate::feeds::{HistorySource, HistoryWindow, PriceSample};
use crate::state::{seconds, ForecastResponse, PricePoint};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CrpsReport {
    /// CRPS averaged over every time point
    pub crps: f64,
    pub num_simulations: usize,
    pub num_time_points: usize,
    pub horizon_secs: i64,
}

/// CRPS of one ensemble against one observation. None for an empty ensemble.
pub fn crps_ensemble(members: &[f64], observed: f64) -> Option<f64> {
    if members.is_empty() {
        return None;
    }
    let m = members.len() as f64;

    let abs_err = members.iter().map(|x| (x - observed).abs()).sum::<f64>() / m;

    let mut sorted = members.to_vec();
    sorted.sort_by(f64::total_cmp);
    let spread = sorted
        .iter()
        .enumerate()
        .map(|(k, x)| (2.0 * k as f64 - m + 1.0) * x)
        .sum::<f64>()
        / (m * m);

    Some((abs_err - spread).max(0.0))
}

/// Score a bundle of paths against realized prices on the same time grid.
pub fn score_bundle(paths: &[Vec<PricePoint>], realized: &[PricePoint]) -> EngineResult<CrpsReport> {
    let first = paths
        .first()
        .ok_or_else(|| EngineError::ShapeMismatch("no paths to score".into()))?;
    if realized.is_empty() {
        return Err(EngineError::ShapeMismatch("no realized prices to score against".into()));
    }
    if let Some(bad) = paths.iter().position(|p| p.len() != realized.len()) {
        return Err(EngineError::ShapeMismatch(format!(
            "path {bad} has {} points, realized series has {}",
            paths[bad].len(),
            realized.len()
        )));
    }
    if let Some(i) = first.iter().zip(realized).position(|(p, r)| p.time != r.time) {
        return Err(EngineError::ShapeMismatch(format!(
            "realized point {i} at {} does not line up with forecast time {}",
            realized[i].time.to_rfc3339(),
            first[i].time.to_rfc3339()
        )));
    }

    let mut members = Vec::with_capacity(paths.len());
    let mut total = 0.0;
    for (t, actual) in realized.iter().enumerate() {
        members.clear();
        members.extend(paths.iter().map(|p| p[t].price));
        total += crps_ensemble(&members, actual.price).unwrap_or(0.0);
    }

    let horizon_secs = match (realized.first(), realized.last()) {
        (Some(a), Some(b)) => (b.time - a.time).num_seconds(),
        _ => 0,
    };

    Ok(CrpsReport {
        crps: total / realized.len() as f64,
        num_simulations: paths.len(),
        num_time_points: realized.len(),
        horizon_secs,
    })
}

/// Order named candidates by CRPS, best first. Failed scorings rank last.
pub fn rank_models(results: Vec<(String, EngineResult<CrpsReport>)>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = results
        .into_iter()
        .map(|(name, r)| {
            let score = match r {
                Ok(report) => report.crps,
                Err(e) => {
                    tracing::warn!(model = %name, error = %e, "scoring failed");
                    f64::INFINITY
                }
            };
            (name, score)
        })
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked
}

/// Realized price at each grid time: the latest sample at or before it, no
/// older than `tolerance`. Stops at the first grid time without one.
pub fn realized_on_grid(
    grid: &[PricePoint],
    samples: &[PriceSample],
    tolerance: chrono::Duration,
) -> Vec<PricePoint> {
    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|s| s.time);
    grid.iter()
        .map_while(|p| {
            let idx = sorted.partition_point(|s| s.time <= p.time);
            let sample = sorted.get(idx.checked_sub(1)?)?;
            (p.time - sample.time <= tolerance).then_some(PricePoint { time: p.time, price: sample.price })
        })
        .collect()
}

/// Score `response` against realized history over the part of its horizon
/// elapsed by `now`. Empty when fewer than two grid points can be scored.
pub async fn score_elapsed<H: HistorySource>(
    history: &H,
    response: &ForecastResponse,
    now: DateTime<Utc>,
    interval_secs: u64,
) -> EngineResult<Vec<(String, EngineResult<CrpsReport>)>> {
    let Some(first) = response.paths.first() else {
        return Ok(Vec::new());
    };
    let elapsed: Vec<PricePoint> = first.iter().take_while(|p| p.time <= now).copied().collect();
    if elapsed.len() < 2 {
        return Ok(Vec::new());
    }

    let step_secs = response.time_increment.max(interval_secs);
    let step = seconds(step_secs)
        .ok_or_else(|| EngineError::InvalidRequest(format!("step of {step_secs}s is out of range")))?;
    let window = HistoryWindow {
        start: response.start_time.checked_sub_signed(step).unwrap_or(response.start_time),
        end: now,
        interval_secs: step_secs,
    };

    let samples = history.get_history(&response.asset, &window).await?;
    let realized = realized_on_grid(&elapsed, &samples, step);
    if realized.len() < 2 {
        return Ok(Vec::new());
    }
    Ok(score_by_variant(response, &realized))
}

/// Score each variant's share of a response on the elapsed prefix `realized`.
/// Paths are grouped by the allocation recorded in the metadata.
pub fn score_by_variant(
    response: &ForecastResponse,
    realized: &[PricePoint],
) -> Vec<(String, EngineResult<CrpsReport>)> {
    let k = realized.len();
    let mut offset = 0;
    let mut results = Vec::with_capacity(response.metadata.allocation.len() + 1);

    for alloc in &response.metadata.allocation {
        let end = (offset + alloc.paths).min(response.paths.len());
        let group: Vec<Vec<PricePoint>> = response.paths[offset..end]
            .iter()
            .map(|p| p.iter().take(k).copied().collect())
            .collect();
        results.push((alloc.variant.name().to_string(), score_bundle(&group, realized)));
        offset = end;
    }

    let all: Vec<Vec<PricePoint>> = response
        .paths
        .iter()
        .map(|p| p.iter().take(k).copied().collect())
        .collect();
    results.push(("ensemble".to_string(), score_bundle(&all, realized)));
    results
}
