use super::StepParams;
use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

/// Geometric drift-diffusion.
///
/// ln S_{t+1} = ln S_t + mu * dt + sigma * sqrt(dt) * z,  z ~ N(0, 1)
///
/// mu is the calibrated mean log-return, so no Ito correction is applied.
/// Prices are positive by construction.
#[inline]
pub fn step<R: Rng + ?Sized>(price: f64, p: &StepParams, normal: &Normal, rng: &mut R) -> f64 {
    let z: f64 = normal.sample(rng);
    price * (p.drift_dt + p.vol_sqrt_dt * z).exp()
}
