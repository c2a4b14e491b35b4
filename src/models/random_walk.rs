use super::StepParams;
use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

const MAX_RESAMPLES: usize = 32;

/// Unbiased multiplicative random walk.
///
/// S_{t+1} = S_t * (1 + e),  e ~ N(0, sigma * sqrt(dt))
///
/// No drift term. Draws with 1 + e <= 0 are rejected and redrawn so the
/// price stays strictly positive.
#[inline]
pub fn step<R: Rng + ?Sized>(price: f64, p: &StepParams, normal: &Normal, rng: &mut R) -> f64 {
    for _ in 0..MAX_RESAMPLES {
        let eps = p.vol_sqrt_dt * normal.sample(rng);
        let next = price * (1.0 + eps);
        if next > 0.0 && next.is_finite() {
            return next;
        }
    }
    // Only reachable with absurd volatility; hold the price for this step
    price
}
