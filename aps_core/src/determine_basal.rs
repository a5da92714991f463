//! Decision engine: temp basal and micro-bolus from the cycle's estimates.
//!
//! Order of precedence:
//! 1. invalid configuration aborts with [`ApsError::Config`];
//! 2. stale or missing inputs produce a fail-safe cancel;
//! 3. glucose or predictions below the low threshold force a zero temp;
//! 4. otherwise the eventual glucose picks the low / in-range / high branch.
//!
//! Every adjustment is appended to the rationale string.

use chrono::{DateTime, Utc};

use crate::cob::CobResult;
use crate::config::Profile;
use crate::error::ApsError;
use crate::fixed_point::{floor_to_increment, round_to_increment};
use crate::glucose::{GlucoseStatus, SENSOR_ERROR_MAX};
use crate::iob::IobSnapshot;
use crate::overrides::adjust_targets_for_ratio;
use crate::sensitivity::AutosensResult;
use crate::suggestion::{Predictions, Suggestion, TempBasal};
use crate::types::CurrentTemp;
use crate::util::{STEP_MINUTES, minutes_between, round_to};

/// Default temp basal length, minutes.
pub const TEMP_MINUTES: u32 = 30;
/// A matching temp with more than this left is not re-issued.
const KEEP_TEMP_MINUTES: f64 = 20.0;
/// Predicted deviations fade to zero over this many 5-minute steps.
const DEVIATION_DECAY_STEPS: f64 = 12.0;
/// Remaining carbs are assumed to absorb evenly over this many steps.
const COB_ABSORPTION_STEPS: usize = 36;
/// The minimum predicted BG ignores the first 30 minutes.
const MIN_PRED_SKIP_STEPS: usize = 6;
const PRED_FLOOR: f64 = 39.0;
const PRED_CEIL: f64 = 401.0;

/// Inputs for one decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub glucose: Option<&'a GlucoseStatus>,
    pub current_temp: CurrentTemp,
    /// IOB trajectory; element 0 is now.
    pub iob: &'a [IobSnapshot],
    /// Effective profile, overrides already applied.
    pub profile: &'a Profile,
    pub autosens: &'a AutosensResult,
    pub meal: &'a CobResult,
    pub microbolus_allowed: bool,
    pub smb_disabled: bool,
    pub temp_target_active: bool,
    /// Units left in the pump, if known.
    pub reservoir: Option<f64>,
    /// When pump history was last refreshed; `None` when it never was.
    pub pump_updated_at: Option<DateTime<Utc>>,
    /// Ledger doses whose delivery is unknown.
    pub uncertain_doses: usize,
    pub now: DateTime<Utc>,
}

/// First reason the inputs cannot be trusted, if any.
fn fail_safe_reason(inp: &DecisionInputs<'_>) -> Option<String> {
    let safety = &inp.profile.safety;
    let Some(gs) = inp.glucose else {
        return Some("no glucose data".into());
    };
    if gs.glucose <= f64::from(SENSOR_ERROR_MAX) {
        return Some(format!("CGM error value {}", gs.glucose));
    }
    if gs.is_stale(inp.now, safety.max_glucose_age_min) {
        return Some(format!(
            "glucose data is {:.0} min old (max {})",
            gs.age_minutes(inp.now),
            safety.max_glucose_age_min
        ));
    }
    let Some(pump_updated_at) = inp.pump_updated_at else {
        return Some("no pump history, IOB unknown".into());
    };
    let pump_age = minutes_between(pump_updated_at, inp.now);
    if pump_age > safety.max_pump_age_min {
        return Some(format!(
            "pump history is {pump_age:.0} min old (max {})",
            safety.max_pump_age_min
        ));
    }
    if let Some(r) = inp.reservoir.filter(|r| *r <= safety.min_reservoir_units) {
        return Some(format!(
            "reservoir {r} U at or below {} U",
            safety.min_reservoir_units
        ));
    }
    if inp.uncertain_doses > 0 {
        return Some(format!(
            "{} dose(s) with uncertain delivery",
            inp.uncertain_doses
        ));
    }
    if inp.iob.is_empty() {
        return Some("no IOB data".into());
    }
    None
}

fn clamp_pred(bg: f64) -> f64 {
    bg.clamp(PRED_FLOOR, PRED_CEIL).round()
}

/// IOB-only and (when carbs remain) COB glucose curves.
fn predict(bg: f64, iob: &[IobSnapshot], sens: f64, ci: f64, cob: f64, csf: f64) -> Predictions {
    let carb_impact = if cob > 0.0 {
        cob * csf / COB_ABSORPTION_STEPS as f64
    } else {
        0.0
    };
    let mut iob_pred = vec![bg];
    let mut cob_pred = if cob > 0.0 { vec![bg] } else { Vec::new() };
    for (i, tick) in iob.iter().enumerate().skip(1) {
        let pred_bgi = -tick.activity * sens * STEP_MINUTES as f64;
        let pred_dev = ci * (1.0 - i as f64 / DEVIATION_DECAY_STEPS).max(0.0);
        let next = iob_pred[i - 1] + pred_bgi + pred_dev;
        iob_pred.push(clamp_pred(next));
        if cob > 0.0 {
            let carbs = if i <= COB_ABSORPTION_STEPS { carb_impact } else { 0.0 };
            let next = cob_pred[i - 1] + pred_bgi + pred_dev + carbs;
            cob_pred.push(clamp_pred(next));
        }
    }
    Predictions {
        iob: iob_pred,
        cob: cob_pred,
    }
}

fn min_after_skip(curve: &[f64]) -> Option<f64> {
    curve
        .iter()
        .skip(MIN_PRED_SKIP_STEPS)
        .copied()
        .min_by(f64::total_cmp)
}

/// Highest rate the engine may ever request right now.
pub fn max_safe_basal(profile: &Profile, scheduled: f64) -> f64 {
    profile
        .max_basal
        .min(profile.max_daily_safety_multiplier * profile.basal.max_daily_rate())
        .min(profile.current_basal_safety_multiplier * scheduled)
}

struct TempPlanner<'a> {
    profile: &'a Profile,
    current: CurrentTemp,
    max_safe: f64,
}

impl TempPlanner<'_> {
    fn round_basal(&self, rate: f64) -> f64 {
        round_to_increment(rate.max(0.0), self.profile.basal_increment)
    }

    /// Clamp, round, and skip re-issuing a temp that is already running.
    fn set(&self, rate: f64, duration: u32, notes: &mut Vec<String>) -> Option<TempBasal> {
        let mut rate = rate;
        if rate > self.max_safe {
            notes.push(format!(
                "adj. req. rate {:.2} to maxSafeBasal {:.2}",
                rate, self.max_safe
            ));
            rate = self.max_safe;
        }
        let rate = self.round_basal(rate);
        if self.current.duration > KEEP_TEMP_MINUTES
            && (self.round_basal(self.current.rate) - rate).abs() < 1e-9
        {
            notes.push(format!(
                "temp {} with {:.0}m left ~ req {rate} U/h, no change",
                self.current.rate, self.current.duration
            ));
            return None;
        }
        Some(TempBasal { rate, duration })
    }
}

/// Recommend a temp basal and optional micro-bolus.
pub fn determine_basal(inp: &DecisionInputs<'_>) -> Result<Suggestion, ApsError> {
    let profile = inp.profile;
    profile.validate()?;
    let now = inp.now;

    if let Some(reason) = fail_safe_reason(inp) {
        tracing::warn!(%reason, "fail-safe: cancelling temp, no bolus");
        return Ok(Suggestion::fail_safe(now, reason));
    }
    let (Some(gs), Some(iob0)) = (inp.glucose, inp.iob.first()) else {
        return Ok(Suggestion::fail_safe(now, "missing glucose or IOB"));
    };

    let bg = gs.glucose;
    let ratio = inp.autosens.ratio;
    let sens = round_to(profile.sens / ratio, 1);
    let carb_ratio = if inp.autosens.adjusted_cr.is_some() {
        round_to(profile.carb_ratio / ratio, 1)
    } else {
        profile.carb_ratio
    };
    let scheduled = profile.current_basal(now);
    let planner = TempPlanner {
        profile,
        current: inp.current_temp,
        max_safe: max_safe_basal(profile, scheduled),
    };
    let basal = planner.round_basal(scheduled * ratio);

    let mut notes: Vec<String> = Vec::new();
    if (ratio - 1.0).abs() > f64::EPSILON {
        notes.push(format!(
            "sensitivity ratio {ratio:.2}: ISF {} → {sens}, basal {scheduled} → {basal}",
            profile.sens
        ));
    }
    let mut targets = profile.targets;
    if let Some(adjusted) =
        adjust_targets_for_ratio(&targets, ratio, &profile.sensitivity, inp.temp_target_active)
    {
        notes.push(format!(
            "target {:.0} → {:.0}",
            targets.target_bg(),
            adjusted.target_bg()
        ));
        targets = adjusted;
    }
    let (min_bg, max_bg, target) = (targets.min_bg, targets.max_bg, targets.target_bg());
    let threshold = profile
        .safety
        .low_glucose_suspend
        .unwrap_or(min_bg - 0.5 * (min_bg - 40.0));

    // deviation from what insulin alone explains, projected 30 minutes
    let min_delta = gs.delta.min(gs.short_avg_delta);
    let min_avg_delta = gs.short_avg_delta.min(gs.long_avg_delta);
    let bgi = round_to(-iob0.activity * sens * STEP_MINUTES as f64, 2);
    let mut deviation = (6.0 * (min_delta - bgi)).round();
    if deviation < 0.0 {
        deviation = (6.0 * (min_avg_delta - bgi)).round();
        if deviation < 0.0 {
            deviation = (6.0 * (gs.long_avg_delta - bgi)).round();
        }
    }
    let naive_eventual = (bg - iob0.iob * sens).round();
    let mut eventual = naive_eventual + deviation;

    let cob = inp.meal.cob;
    let csf = sens / carb_ratio;
    let ci = round_to(min_delta - bgi, 1);
    let preds = predict(bg, inp.iob, sens, ci, cob, csf);
    // carbs still to absorb lift the eventual BG to the end of the COB curve
    if let Some(&last_cob_pred) = preds.cob.last() {
        eventual = eventual.max(last_cob_pred);
    }
    let min_iob_pred = min_after_skip(&preds.iob).unwrap_or(eventual);
    let min_pred = match min_after_skip(&preds.cob) {
        Some(min_cob_pred) => min_iob_pred.max(min_cob_pred),
        None => min_iob_pred,
    };

    let high_temp_target = inp.temp_target_active && target > 100.0;
    let smb_enabled = inp.microbolus_allowed
        && !inp.smb_disabled
        && !(high_temp_target && !profile.smb.allow_with_high_temptarget)
        && (profile.smb.enable_always || (profile.smb.enable_with_cob && cob > 0.0));

    let mut temp = None;
    let mut units = None;
    let mut insulin_req = 0.0;

    if bg < threshold || min_pred < threshold {
        notes.push(format!(
            "BG {bg} or minPredBG {min_pred} below threshold {threshold}, zero temp"
        ));
        temp = planner.set(0.0, TEMP_MINUTES, &mut notes);
    } else if eventual < min_bg {
        if min_delta > bgi && min_delta > 0.0 {
            notes.push(format!(
                "Eventual BG {eventual} < {min_bg} but Delta {min_delta} > expected {bgi}, setting basal"
            ));
            temp = planner.set(basal, TEMP_MINUTES, &mut notes);
        } else {
            insulin_req = round_to(2.0 * ((eventual - target) / sens).min(0.0), 2);
            let rate = basal + 2.0 * insulin_req;
            notes.push(format!(
                "Eventual BG {eventual} < {min_bg}, insulinReq {insulin_req}, temp {:.2}",
                planner.round_basal(rate)
            ));
            temp = planner.set(rate, TEMP_MINUTES, &mut notes);
        }
    } else {
        let req = round_to((eventual.min(min_pred) - target) / sens, 2);
        if eventual.min(min_pred) < max_bg || req <= 0.0 {
            notes.push(format!("Eventual BG {eventual} in range, setting basal {basal}"));
            temp = planner.set(basal, TEMP_MINUTES, &mut notes);
        } else {
            let headroom = (profile.max_iob - iob0.iob).max(0.0);
            insulin_req = req;
            if insulin_req > headroom {
                notes.push(format!(
                    "max IOB {}, insulinReq {insulin_req} → {:.2}",
                    profile.max_iob, headroom
                ));
                insulin_req = round_to(headroom, 2);
            }
            let rate = basal + 2.0 * insulin_req;
            notes.push(format!(
                "Eventual BG {eventual} >= {max_bg}, insulinReq {insulin_req}"
            ));

            if smb_enabled && insulin_req > 0.0 && bg > threshold {
                let smb = &profile.smb;
                let minutes = if cob > 0.0 {
                    smb.max_smb_basal_minutes
                } else {
                    smb.max_uam_smb_basal_minutes
                };
                let max_bolus = round_to(scheduled * f64::from(minutes) / 60.0, 1);
                let mut micro = floor_to_increment(
                    (insulin_req * smb.smb_delivery_ratio).min(max_bolus),
                    smb.bolus_increment,
                );
                micro = micro.min(floor_to_increment(headroom, smb.bolus_increment));
                if let Some(r) = inp.reservoir {
                    let usable = (r - profile.safety.min_reservoir_units).max(0.0);
                    micro = micro.min(floor_to_increment(usable, smb.bolus_increment));
                }
                let since_bolus = iob0
                    .last_bolus_time
                    .map(|t| minutes_between(t, now));
                if let Some(m) = since_bolus.filter(|m| *m < f64::from(smb.smb_interval_min)) {
                    notes.push(format!(
                        "waiting {:.0}m for microbolus",
                        f64::from(smb.smb_interval_min) - m
                    ));
                    micro = 0.0;
                }
                if micro > 0.0 {
                    units = Some(micro);
                    notes.push(format!("microbolusing {micro}U"));
                    // hold basal low while the bolus acts if the worst case undershoots
                    let worst = (target - (naive_eventual + min_iob_pred) / 2.0) / sens;
                    let duration_req = if worst > 0.0 && scheduled > 0.0 {
                        (((60.0 * worst / scheduled) / 30.0).round() * 30.0).clamp(0.0, 60.0)
                    } else {
                        0.0
                    };
                    if duration_req > 0.0 {
                        notes.push(format!("setting {duration_req:.0}m zero temp"));
                        temp = planner.set(0.0, duration_req as u32, &mut notes);
                    } else {
                        temp = planner.set(rate, TEMP_MINUTES, &mut notes);
                    }
                }
            }
            if units.is_none() {
                let rounded = planner.round_basal(rate.min(planner.max_safe));
                if inp.current_temp.duration > 5.0
                    && planner.round_basal(inp.current_temp.rate) >= rounded
                {
                    notes.push(format!(
                        "temp {} >= req {rounded} U/h, no change",
                        inp.current_temp.rate
                    ));
                } else {
                    temp = planner.set(rate, TEMP_MINUTES, &mut notes);
                }
            }
        }
    }

    let reason = format!(
        "COB: {cob}, Dev: {deviation}, BGI: {bgi}, ISF: {sens}, CR: {carb_ratio}, Target: {target}, minPredBG: {min_pred}, Eventual BG: {eventual}; {}",
        notes.join("; ")
    );
    tracing::debug!(
        bg,
        eventual,
        min_pred,
        insulin_req,
        rate = temp.map(|t| t.rate),
        units,
        "determine_basal"
    );
    Ok(Suggestion {
        temp,
        units,
        reason,
        timestamp: now,
        deliver_at: now,
        bg: Some(bg),
        eventual_bg: Some(eventual),
        min_pred_bg: Some(min_pred),
        iob: iob0.iob,
        cob,
        sensitivity_ratio: ratio,
        insulin_req,
        target_bg: Some(target),
        isf: Some(sens),
        carb_ratio: Some(carb_ratio),
        predictions: Some(preds),
        fail_safe: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iob::TRAJECTORY_STEPS;
    use crate::types::TrendDirection;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap()
    }

    fn status(bg: f64, age_min: i64) -> GlucoseStatus {
        GlucoseStatus {
            glucose: bg,
            date: now() - Duration::minutes(age_min),
            delta: 0.0,
            short_avg_delta: 0.0,
            long_avg_delta: 0.0,
            direction: TrendDirection::Flat,
        }
    }

    fn flat_iob() -> Vec<IobSnapshot> {
        (0..=TRAJECTORY_STEPS as i64)
            .map(|i| IobSnapshot::empty(now() + Duration::minutes(5 * i)))
            .collect()
    }

    struct Fixture {
        profile: Profile,
        autosens: AutosensResult,
        meal: CobResult,
        iob: Vec<IobSnapshot>,
    }

    impl Fixture {
        fn new() -> Self {
            let profile = Profile::default();
            Self {
                autosens: AutosensResult::neutral(profile.sens, None),
                profile,
                meal: CobResult::default(),
                iob: flat_iob(),
            }
        }

        fn inputs<'a>(&'a self, gs: Option<&'a GlucoseStatus>) -> DecisionInputs<'a> {
            DecisionInputs {
                glucose: gs,
                current_temp: CurrentTemp::default(),
                iob: &self.iob,
                profile: &self.profile,
                autosens: &self.autosens,
                meal: &self.meal,
                microbolus_allowed: false,
                smb_disabled: false,
                temp_target_active: false,
                reservoir: Some(100.0),
                pump_updated_at: Some(now()),
                uncertain_doses: 0,
                now: now(),
            }
        }
    }

    #[test]
    fn stale_glucose_cancels() {
        let f = Fixture::new();
        let gs = status(180.0, 20);
        let s = determine_basal(&f.inputs(Some(&gs))).unwrap();
        assert!(s.fail_safe);
        assert_eq!(s.temp, Some(TempBasal::CANCEL));
        assert_eq!(s.units, None);
    }

    #[test]
    fn uncertain_doses_and_low_reservoir_cancel() {
        let f = Fixture::new();
        let gs = status(180.0, 0);
        let mut inp = f.inputs(Some(&gs));
        inp.uncertain_doses = 1;
        assert!(determine_basal(&inp).unwrap().fail_safe);
        let mut inp = f.inputs(Some(&gs));
        inp.reservoir = Some(0.4);
        assert!(determine_basal(&inp).unwrap().fail_safe);
        let mut inp = f.inputs(Some(&gs));
        inp.pump_updated_at = Some(now() - Duration::minutes(16));
        assert!(determine_basal(&inp).unwrap().fail_safe);
        let mut inp = f.inputs(Some(&gs));
        inp.pump_updated_at = None;
        let s = determine_basal(&inp).unwrap();
        assert!(s.fail_safe);
        assert!(s.reason.contains("no pump history"));
    }

    #[test]
    fn invalid_profile_is_config_error() {
        let mut f = Fixture::new();
        f.profile.carb_ratio = 0.05;
        let gs = status(120.0, 0);
        let err = determine_basal(&f.inputs(Some(&gs))).unwrap_err();
        assert!(matches!(err, ApsError::Config(_)));
    }

    #[test]
    fn below_threshold_zero_temps_without_bolus() {
        let mut f = Fixture::new();
        f.profile.smb.enable_always = true;
        let gs = status(65.0, 0);
        let mut inp = f.inputs(Some(&gs));
        inp.microbolus_allowed = true;
        let s = determine_basal(&inp).unwrap();
        assert_eq!(s.temp, Some(TempBasal { rate: 0.0, duration: 30 }));
        assert_eq!(s.units, None);
        assert!(!s.fail_safe);
    }

    #[test]
    fn at_target_sets_basal_or_keeps_matching_temp() {
        let f = Fixture::new();
        let gs = status(100.0, 0);
        let s = determine_basal(&f.inputs(Some(&gs))).unwrap();
        assert_eq!(s.temp, Some(TempBasal { rate: 1.0, duration: 30 }));

        let mut inp = f.inputs(Some(&gs));
        inp.current_temp = CurrentTemp { rate: 1.0, duration: 25.0 };
        let s = determine_basal(&inp).unwrap();
        assert_eq!(s.temp, None);
        assert!(s.reason.contains("no change"));
    }

    #[test]
    fn high_glucose_raises_temp_within_max_safe() {
        let f = Fixture::new();
        let gs = status(200.0, 0);
        let s = determine_basal(&f.inputs(Some(&gs))).unwrap();
        assert_eq!(s.insulin_req, 2.0);
        // basal 1 + 2 × 2 = 5, capped by max_basal 3 and 3 × max daily
        assert_eq!(s.temp, Some(TempBasal { rate: 3.0, duration: 30 }));
        assert!(s.reason.contains("maxSafeBasal"));
        assert_eq!(s.units, None);
    }

    #[test]
    fn high_glucose_microbolus_sized_and_clamped() {
        let mut f = Fixture::new();
        f.profile.smb.enable_always = true;
        let gs = status(200.0, 0);
        let mut inp = f.inputs(Some(&gs));
        inp.microbolus_allowed = true;
        let s = determine_basal(&inp).unwrap();
        // min(2.0 × 0.5, 30 basal minutes = 0.5)
        assert_eq!(s.units, Some(0.5));
        assert!(s.units.unwrap() <= f.profile.max_iob);
    }

    #[test]
    fn carbs_on_board_raise_eventual_and_insulin_req() {
        let gs = status(120.0, 0);
        let plain = Fixture::new();
        let without = determine_basal(&plain.inputs(Some(&gs))).unwrap();

        let mut fed = Fixture::new();
        fed.meal.cob = 60.0;
        let with = determine_basal(&fed.inputs(Some(&gs))).unwrap();

        assert_eq!(without.eventual_bg, Some(120.0));
        let cob_curve = &with.predictions.as_ref().unwrap().cob;
        assert_eq!(with.eventual_bg, cob_curve.last().copied());
        assert!(with.eventual_bg.unwrap() > 120.0);
        assert!(with.insulin_req > without.insulin_req);
        assert!(with.insulin_req <= fed.profile.max_iob);
    }

    #[test]
    fn low_eventual_reduces_temp() {
        let mut f = Fixture::new();
        for (i, snap) in f.iob.iter_mut().enumerate() {
            snap.iob = 1.0 - i as f64 / 60.0;
        }
        let gs = status(110.0, 0);
        let s = determine_basal(&f.inputs(Some(&gs))).unwrap();
        // naive eventual 110 − 50 = 60 → insulinReq 2 × (60 − 100) / 50 = −1.6
        assert_eq!(s.eventual_bg, Some(60.0));
        assert_eq!(s.insulin_req, -1.6);
        assert_eq!(s.temp, Some(TempBasal { rate: 0.0, duration: 30 }));
    }
}
