mod bundle;
mod config;
mod engine;
mod errors;
mod feeds;
mod models;
mod scoring;
mod state;

use crate::engine::ForecastEngine;
use crate::feeds::http::HttpFeed;
use crate::feeds::{HistorySource, PriceSource};
use crate::state::*;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::io::Write;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("synth forecaster starting");

    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    let timeout = cfg.engine.price_timeout;
    let prices = HttpFeed::new(&cfg.price_api_base_url, &cfg.history_api_base_url, timeout);
    // Second handle for scoring elapsed forecasts; shares the connection pool
    let history = prices.clone();

    let engine = match ForecastEngine::new(cfg.engine.clone(), prices.clone(), prices) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("engine init error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        assets = ?cfg.assets.iter().map(AssetId::as_str).collect::<Vec<_>>(),
        num_simulations = cfg.num_simulations,
        time_increment = cfg.time_increment_secs,
        time_length = cfg.time_length_secs,
        weights = ?cfg.engine.weights,
        "engine ready"
    );

    let mut previous: HashMap<AssetId, ForecastResponse> = HashMap::new();

    if cfg.forecast_interval_secs == 0 {
        run_pass(&engine, &cfg, &mut previous).await;
    } else {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(cfg.forecast_interval_secs));
        loop {
            interval.tick().await;
            score_previous(&history, &previous, cfg.engine.calibration.interval_secs).await;
            run_pass(&engine, &cfg, &mut previous).await;
        }
    }

    let c = engine.counters();
    tracing::info!(
        requested = c.forecasts_requested,
        succeeded = c.forecasts_succeeded,
        failed = c.forecasts_failed,
        calibrations = c.calibrations_computed,
        cache_hits = c.calibration_cache_hits,
        prior_fallbacks = c.prior_fallbacks,
        "engine shutting down"
    );
}

/// One forecast per configured asset, run concurrently.
/// Responses go to stdout as JSON lines; failures are logged with their reason.
async fn run_pass<P: PriceSource, H: HistorySource>(
    engine: &ForecastEngine<P, H>,
    cfg: &config::AppConfig,
    previous: &mut HashMap<AssetId, ForecastResponse>,
) {
    let inputs: Vec<SimulationInput> = cfg
        .assets
        .iter()
        .map(|asset| SimulationInput {
            asset: asset.as_str().to_string(),
            num_simulations: cfg.num_simulations,
            time_increment_seconds: cfg.time_increment_secs,
            time_length_seconds: cfg.time_length_secs,
            start_time: None,
        })
        .collect();

    let results = join_all(inputs.iter().map(|input| engine.generate_forecast(input))).await;

    let stdout = std::io::stdout();
    for (input, result) in inputs.iter().zip(results) {
        match result {
            Ok(resp) => {
                match serde_json::to_string(&resp) {
                    Ok(line) => {
                        let mut out = stdout.lock();
                        if let Err(e) = writeln!(out, "{line}") {
                            tracing::error!(error = %e, "stdout write failed");
                        }
                    }
                    Err(e) => tracing::error!(asset = %input.asset, error = %e, "serialize failed"),
                }
                previous.insert(resp.asset.clone(), resp);
            }
            Err(e) => {
                tracing::error!(asset = %input.asset, reason = e.reason_code(), "forecast not produced: {e}");
            }
        }
    }

    let c = engine.counters();
    tracing::info!(
        succeeded = c.forecasts_succeeded,
        failed = c.forecasts_failed,
        cache_hits = c.calibration_cache_hits,
        prior_fallbacks = c.prior_fallbacks,
        "pass complete"
    );
}

/// Score the last forecast per asset against whatever part of its horizon has elapsed.
async fn score_previous<H: HistorySource>(
    history: &H,
    previous: &HashMap<AssetId, ForecastResponse>,
    interval_secs: u64,
) {
    let now = chrono::Utc::now();
    for (asset, resp) in previous {
        let scores = match scoring::score_elapsed(history, resp, now, interval_secs).await {
            Ok(s) if s.is_empty() => {
                tracing::debug!(asset = %asset, "not enough elapsed horizon to score");
                continue;
            }
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(asset = %asset, error = %e, "realized history unavailable, skipping score");
                continue;
            }
        };

        for (name, report) in scores.iter().filter_map(|(n, r)| Some((n, r.as_ref().ok()?))) {
            tracing::debug!(
                asset = %asset,
                model = %name,
                crps = report.crps,
                paths = report.num_simulations,
                points = report.num_time_points,
                horizon_secs = report.horizon_secs,
                "variant scored"
            );
        }

        for (rank, (name, crps)) in scoring::rank_models(scores).iter().enumerate() {
            tracing::info!(asset = %asset, rank = rank + 1, model = %name, crps = crps, "forecast score");
        }
    }
}
