//! Common rounding and time helpers for aps_core.

use chrono::{DateTime, Utc};

/// Minutes per control cycle and per prediction step.
pub const STEP_MINUTES: i64 = 5;
/// Milliseconds in one minute.
pub const MILLIS_PER_MIN: f64 = 60_000.0;

/// Round to `digits` decimal places, half away from zero.
#[inline]
pub fn round_to(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).round() / scale
}

/// Fractional minutes from `from` to `to` (negative when `to` is earlier).
#[inline]
pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    to.signed_duration_since(from).num_milliseconds() as f64 / MILLIS_PER_MIN
}

/// Clamp that tolerates reversed bounds and maps NaN to `lo`.
#[inline]
pub fn clamp_f64(x: f64, lo: f64, hi: f64) -> f64 {
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    if x.is_nan() { lo } else { x.clamp(lo, hi) }
}

/// Linear-interpolated percentile of an already sorted slice, `p` in [0, 1].
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = clamp_f64(p, 0.0, 1.0);
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
