use super::StepParams;
use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

/// Mean-reverting diffusion in log space (discrete Ornstein-Uhlenbeck).
///
/// x_{t+1} = x_t + k * dt * (ln A - x_t) + sigma * sqrt(dt) * z
///
/// A is the anchor price (start price at calibration time). k * dt is
/// clamped to [0, 1] so a step never overshoots the anchor deterministically.
#[inline]
pub fn step<R: Rng + ?Sized>(price: f64, p: &StepParams, normal: &Normal, rng: &mut R) -> f64 {
    let z: f64 = normal.sample(rng);
    let x = price.ln();
    (x + p.pull * (p.ln_anchor - x) + p.vol_sqrt_dt * z).exp()
}
