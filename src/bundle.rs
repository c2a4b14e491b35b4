use crate::errors::{EngineError, EngineResult};
use crate::state::{
    seconds, ForecastMetadata, ForecastRequest, ForecastResponse, SimulationBundle, SimulationPath,
};

/// Terminal sanity gate before a bundle leaves the engine.
///
/// Checks, in order, for every path:
///   1. bundle size == num_simulations                (ShapeMismatch)
///   2. path length == horizon / time_increment + 1   (ShapeMismatch)
///   3. first point == (start_time, start_price)      (ShapeMismatch)
///   4. timestamps strictly increase by exactly time_increment (NonMonotonicTime)
///   5. prices finite and strictly positive           (InvalidPrice)
///
/// A malformed bundle is never returned; downstream would score it as a
/// failed submission.
pub fn format_and_validate(
    bundle: SimulationBundle,
    request: &ForecastRequest,
    metadata: ForecastMetadata,
) -> EngineResult<ForecastResponse> {
    if bundle.asset != *request.asset() {
        return Err(EngineError::ShapeMismatch(format!(
            "bundle is for {}, request is for {}",
            bundle.asset,
            request.asset()
        )));
    }

    if bundle.paths.len() != request.num_simulations() {
        return Err(EngineError::ShapeMismatch(format!(
            "expected {} paths, got {}",
            request.num_simulations(),
            bundle.paths.len()
        )));
    }

    for (idx, path) in bundle.paths.iter().enumerate() {
        validate_path(idx, path, request)?;
    }

    Ok(ForecastResponse {
        asset: bundle.asset,
        start_time: request.start_time(),
        start_price: request.start_price(),
        time_increment: request.time_increment_secs(),
        time_length: request.horizon_secs(),
        num_simulations: request.num_simulations(),
        metadata,
        paths: bundle.paths.into_iter().map(|p| p.points).collect(),
    })
}

/// Structural checks for a single path.
pub fn validate_path(idx: usize, path: &SimulationPath, request: &ForecastRequest) -> EngineResult<()> {
    let expected = request.expected_points();
    if path.len() != expected {
        return Err(EngineError::ShapeMismatch(format!(
            "path {idx} ({}) has {} points, expected {expected}",
            path.variant,
            path.len()
        )));
    }

    let first = path
        .first()
        .ok_or_else(|| EngineError::ShapeMismatch(format!("path {idx} is empty")))?;
    if first.time != request.start_time() {
        return Err(EngineError::ShapeMismatch(format!(
            "path {idx} starts at {}, expected {}",
            first.time.to_rfc3339(),
            request.start_time().to_rfc3339()
        )));
    }
    if first.price != request.start_price() {
        return Err(EngineError::ShapeMismatch(format!(
            "path {idx} starts at price {}, expected {}",
            first.price,
            request.start_price()
        )));
    }

    let step = seconds(request.time_increment_secs())
        .filter(|s| *s > chrono::Duration::zero())
        .ok_or_else(|| {
            EngineError::NonMonotonicTime(format!(
                "time_increment {}s is not a positive step",
                request.time_increment_secs()
            ))
        })?;
    for (i, w) in path.points.windows(2).enumerate() {
        if w[1].time <= w[0].time {
            return Err(EngineError::NonMonotonicTime(format!(
                "path {idx} point {}: {} does not follow {}",
                i + 1,
                w[1].time.to_rfc3339(),
                w[0].time.to_rfc3339()
            )));
        }
        if w[1].time - w[0].time != step {
            return Err(EngineError::NonMonotonicTime(format!(
                "path {idx} point {}: {} -> {} is not a {}s step",
                i + 1,
                w[0].time.to_rfc3339(),
                w[1].time.to_rfc3339(),
                request.time_increment_secs()
            )));
        }
    }

    if let Some((i, p)) = path
        .points
        .iter()
        .enumerate()
        .find(|(_, p)| !p.price.is_finite() || p.price <= 0.0)
    {
        return Err(EngineError::InvalidPrice(format!("path {idx} point {i} has price {}", p.price)));
    }

    Ok(())
}
