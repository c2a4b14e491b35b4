use crate::feeds::PriceSample;
use statrs::statistics::Statistics;

/// Volatility clamp: per-interval log-return std dev is kept in a sane range
const MIN_VOL: f64 = 1e-8;
const MAX_VOL: f64 = 1.0;

/// Fewer usable prices than this can never yield a sample std dev
const ABSOLUTE_MIN_SAMPLES: usize = 3;

/// Drift/volatility estimate over a window of prices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReturnStats {
    /// Mean log-return per sample interval
    pub drift: f64,
    /// Sample std dev of log-returns per sample interval, clamped
    pub volatility: f64,
    /// Number of prices the estimate used
    pub samples: usize,
}

/// Drop non-positive / non-finite prices and order by time.
/// Duplicate timestamps keep the last observation.
pub fn clean_history(mut samples: Vec<PriceSample>) -> Vec<PriceSample> {
    samples.retain(|s| s.price > 0.0 && s.price.is_finite());
    samples.sort_by_key(|s| s.time);
    let mut out: Vec<PriceSample> = Vec::with_capacity(samples.len());
    for s in samples {
        match out.last_mut() {
            Some(last) if last.time == s.time => *last = s,
            _ => out.push(s),
        }
    }
    out
}

/// Log returns between consecutive prices. Non-finite returns are skipped.
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .filter(|r| r.is_finite())
        .collect()
}

/// Estimate drift (mean log-return) and volatility (std dev of log-returns).
/// Returns None when fewer than `min_samples` prices are available.
pub fn estimate(prices: &[f64], min_samples: usize) -> Option<ReturnStats> {
    let required = min_samples.max(ABSOLUTE_MIN_SAMPLES);
    if prices.len() < required {
        return None;
    }

    let returns = log_returns(prices);
    if returns.len() < required - 1 {
        return None;
    }

    let drift = returns.iter().mean();
    let std_dev = returns.iter().std_dev();
    if !drift.is_finite() || !std_dev.is_finite() {
        return None;
    }

    Some(ReturnStats {
        drift,
        volatility: std_dev.clamp(MIN_VOL, MAX_VOL),
        samples: prices.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_constant_growth_has_drift_and_floor_vol() {
        let prices: Vec<f64> = (0..50).map(|i| 100.0 * 1.01_f64.powi(i)).collect();
        let stats = estimate(&prices, 30).unwrap();
        assert!((stats.drift - 1.01_f64.ln()).abs() < 1e-12);
        assert!(stats.volatility < 1e-6);
        assert_eq!(stats.samples, 50);
    }

    #[test]
    fn test_alternating_series() {
        // up 10%, down back: returns are +r, -r, ...
        let mut prices = Vec::new();
        for i in 0..41 {
            prices.push(if i % 2 == 0 { 100.0 } else { 110.0 });
        }
        let stats = estimate(&prices, 10).unwrap();
        let r = 1.1_f64.ln();
        assert!(stats.drift.abs() < 1e-12);
        // sample std dev of 40 values +-r with mean 0: r * sqrt(40/39)
        let expected = r * (40.0_f64 / 39.0).sqrt();
        assert!((stats.volatility - expected).abs() < 1e-12, "vol={}", stats.volatility);
    }

    #[test]
    fn test_insufficient_samples() {
        assert!(estimate(&[100.0, 101.0], 30).is_none());
        assert!(estimate(&[100.0, 101.0], 0).is_none());
        assert!(estimate(&[100.0, 101.0, 100.5], 0).is_some());
    }

    #[test]
    fn test_clean_history_sorts_and_filters() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let raw = vec![
            PriceSample { time: t0 + Duration::minutes(10), price: 102.0 },
            PriceSample { time: t0, price: 100.0 },
            PriceSample { time: t0 + Duration::minutes(5), price: -1.0 },
            PriceSample { time: t0 + Duration::minutes(5), price: f64::NAN },
            PriceSample { time: t0 + Duration::minutes(10), price: 103.0 },
        ];
        let clean = clean_history(raw);
        let prices: Vec<f64> = clean.iter().map(|s| s.price).collect();
        assert_eq!(prices, vec![100.0, 103.0]);
    }
}
