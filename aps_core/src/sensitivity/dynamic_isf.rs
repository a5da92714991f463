//! Dynamic ISF: sensitivity as a function of current glucose and TDD.

use super::{AutosensResult, TddSummary, clamp_ratio};
use crate::config::Profile;
use crate::util::round_to;

/// Glucose assumed when no reading is available, mg/dL.
pub const DEFAULT_BG: f64 = 100.0;
/// Conversion from mg/dL to mmol/L used by the sigmoid curve.
const MGDL_TO_MMOL: f64 = 0.0555;

/// `120 − peak`, the logarithmic formula's insulin factor.
pub fn insulin_factor(profile: &Profile) -> f64 {
    120.0 - profile.insulin.dynamic_isf_peak()
}

/// Unclamped logarithmic ratio.
pub fn logarithmic_ratio(sens: f64, adjustment_factor: f64, tdd: f64, bg: f64, insulin_factor: f64) -> f64 {
    round_to(
        sens * adjustment_factor * tdd * (bg / insulin_factor + 1.0).ln() / 1800.0,
        2,
    )
}

/// Unclamped sigmoid ratio bounded by `[min, max]`.
///
/// `tdd_factor` is the weighted TDD over the 14-day average.
pub fn sigmoid_ratio(
    bg: f64,
    target: f64,
    adjustment_factor: f64,
    tdd_factor: f64,
    min: f64,
    max: f64,
) -> f64 {
    let interval = max - min;
    let bg_dev = (bg - target) * MGDL_TO_MMOL;
    let max_minus_one = if (max - 1.0).abs() < f64::EPSILON {
        max + 0.01 - 1.0
    } else {
        max - 1.0
    };
    // shifts the curve so that bg == target gives ratio 1
    let fix_offset = (1.0 / max_minus_one - min / max_minus_one).ln();
    let exponent = bg_dev * adjustment_factor * tdd_factor + fix_offset;
    round_to(interval / (1.0 + (-exponent).exp()) + min, 2)
}

/// Ratio from glucose and TDD, or neutral with the reason it is disabled.
pub fn dynamic_isf(
    profile: &Profile,
    bg: Option<f64>,
    target: f64,
    tdd: Option<&TddSummary>,
    exercising: bool,
) -> AutosensResult {
    let cfg = &profile.dynamic_isf;
    let sens = profile.sens;
    let (mut min, mut max) = (
        profile.sensitivity.autosens_min,
        profile.sensitivity.autosens_max,
    );
    if min > max {
        tracing::warn!(min, max, "autosens bounds reversed, swapping");
        std::mem::swap(&mut min, &mut max);
    }
    if (max - min).abs() < f64::EPSILON || max < 1.0 || min > 1.0 {
        return AutosensResult::neutral(
            sens,
            Some(format!(
                "dynamic ISF disabled: autosens bounds [{min}, {max}] do not straddle 1"
            )),
        );
    }
    if exercising {
        return AutosensResult::neutral(
            sens,
            Some("dynamic ISF disabled while exercising".to_string()),
        );
    }
    let Some(tdd) = tdd.filter(|t| t.reliable && t.weighted_average > 0.0) else {
        return AutosensResult::neutral(
            sens,
            Some("dynamic ISF disabled: no reliable TDD average".to_string()),
        );
    };
    if cfg.weight_percentage <= 0.0 {
        return AutosensResult::neutral(
            sens,
            Some("dynamic ISF disabled: TDD weight is 0".to_string()),
        );
    }

    let bg = bg.unwrap_or(DEFAULT_BG);
    let (raw, formula) = if cfg.sigmoid {
        let tdd_factor = if tdd.average_daily > 0.0 {
            tdd.weighted_average / tdd.average_daily
        } else {
            1.0
        };
        (
            sigmoid_ratio(bg, target, cfg.adjustment_factor_sigmoid, tdd_factor, min, max),
            "sigmoid",
        )
    } else {
        (
            logarithmic_ratio(
                sens,
                cfg.adjustment_factor,
                tdd.weighted_average,
                bg,
                insulin_factor(profile),
            ),
            "logarithmic",
        )
    };
    let mut bounds = profile.sensitivity.clone();
    bounds.autosens_min = min;
    bounds.autosens_max = max;
    let ratio = clamp_ratio(raw, &bounds, "dynamic_isf");
    let adjusted_isf = round_to(sens / ratio, 1);
    let adjusted_cr = cfg
        .enable_dynamic_cr
        .then(|| round_to(profile.carb_ratio / ratio, 1));
    tracing::debug!(formula, bg, tdd = tdd.weighted_average, raw, ratio, "dynamic ISF");
    AutosensResult {
        ratio,
        pre_clamp_ratio: raw,
        insufficient_data: false,
        reason: Some(format!(
            "dynamic ISF ({formula}) ratio {ratio:.2}, ISF {sens} → {adjusted_isf}"
        )),
        adjusted_isf,
        adjusted_cr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tdd(weighted: f64) -> TddSummary {
        TddSummary {
            weighted_average: weighted,
            average_daily: weighted,
            reliable: true,
            hours_covered: 48.0,
            ..TddSummary::default()
        }
    }

    #[test]
    fn logarithmic_matches_reference_at_100() {
        let p = Profile::default();
        assert_eq!(insulin_factor(&p), 55.0);
        let expected = round_to(50.0 * 0.8 * 40.0 * (100.0_f64 / 55.0 + 1.0).ln() / 1800.0, 2);
        let r = dynamic_isf(&p, None, 100.0, Some(&tdd(40.0)), false);
        assert_eq!(r.ratio, expected);
        assert_eq!(r.adjusted_isf, round_to(50.0 / expected, 1));
    }

    #[test]
    fn sigmoid_is_neutral_at_target() {
        assert_eq!(sigmoid_ratio(100.0, 100.0, 0.5, 1.0, 0.7, 1.2), 1.0);
        assert!(sigmoid_ratio(250.0, 100.0, 0.5, 1.0, 0.7, 1.2) > 1.0);
        assert!(sigmoid_ratio(70.0, 100.0, 0.5, 1.0, 0.7, 1.2) < 1.0);
    }

    #[test]
    fn disabled_without_reliable_tdd_or_while_exercising() {
        let p = Profile::default();
        let mut t = tdd(40.0);
        t.reliable = false;
        assert_eq!(dynamic_isf(&p, Some(180.0), 100.0, Some(&t), false).ratio, 1.0);
        assert_eq!(dynamic_isf(&p, Some(180.0), 100.0, None, false).ratio, 1.0);
        assert_eq!(dynamic_isf(&p, Some(180.0), 100.0, Some(&tdd(40.0)), true).ratio, 1.0);
    }

    #[test]
    fn disabled_when_bounds_do_not_straddle_one() {
        let mut p = Profile::default();
        p.sensitivity.autosens_min = 1.1;
        p.sensitivity.autosens_max = 1.3;
        let r = dynamic_isf(&p, Some(180.0), 100.0, Some(&tdd(40.0)), false);
        assert_eq!(r.ratio, 1.0);
        assert!(r.reason.unwrap().contains("disabled"));
    }

    #[test]
    fn dynamic_cr_follows_ratio() {
        let mut p = Profile::default();
        p.dynamic_isf.enable_dynamic_cr = true;
        let r = dynamic_isf(&p, Some(160.0), 100.0, Some(&tdd(40.0)), false);
        assert_eq!(r.adjusted_cr, Some(round_to(10.0 / r.ratio, 1)));
    }
}
