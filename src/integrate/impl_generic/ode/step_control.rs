//! Error weights, norms and step-size selection.

use crate::integrate::ode::Tolerance;

/// Safety factor applied to the optimal step size.
pub const SAFETY: f64 = 0.9;
/// Smallest step-size ratio after a rejected or accepted step.
pub const MIN_FACTOR: f64 = 0.2;
/// Largest step-size ratio after an accepted step.
pub const MAX_FACTOR: f64 = 5.0;

/// `w_i = 1 / (rtol_i |y_i| + atol_i / scale)`.
pub fn error_weights(
    y: &[f64],
    rtol: &Tolerance,
    atol: &Tolerance,
    atol_scale: f64,
    out: &mut [f64],
) {
    for (i, (w, yi)) in out.iter_mut().zip(y).enumerate() {
        *w = 1.0 / (rtol.value(i) * yi.abs() + atol.value(i) / atol_scale);
    }
}

/// Weighted root-mean-square norm.
pub fn wrms_norm(v: &[f64], weights: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let sum: f64 = v.iter().zip(weights).map(|(x, w)| (x * w) * (x * w)).sum();
    (sum / v.len() as f64).sqrt()
}

/// Step-size ratio for an error estimate of order `h^3`.
pub fn step_factor(err: f64) -> f64 {
    if err == 0.0 {
        return MAX_FACTOR;
    }
    (SAFETY * err.powf(-1.0 / 3.0)).clamp(MIN_FACTOR, MAX_FACTOR)
}

/// Smallest step the engine may take near `t` and `tout`.
pub fn min_step(t: f64, tout: f64) -> f64 {
    16.0 * f64::EPSILON * t.abs().max(tout.abs()).max(1.0)
}

/// Initial step size from the scales of the state and its derivative.
pub fn initial_step(y: &[f64], f: &[f64], weights: &[f64], span: f64) -> f64 {
    let d0 = wrms_norm(y, weights);
    let d1 = wrms_norm(f, weights);
    let h = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    h.min(span.abs()).max(min_step(0.0, span))
}
