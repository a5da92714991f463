//! Autosens: sensitivity from the median of recent glucose deviations.

use chrono::{DateTime, Duration, Timelike, Utc};

use super::{AutosensResult, clamp_ratio};
use crate::config::Profile;
use crate::glucose::clean_samples;
use crate::history::InsulinDose;
use crate::iob::{ActivityCurve, calculate_iob};
use crate::types::{CarbEntry, GlucoseSample};
use crate::util::{STEP_MINUTES, minutes_between, percentile, round_to};

/// Minimum cleaned glucose samples across the lookback.
pub const MIN_SAMPLES: usize = 72;
/// Lookback windows; the lower resulting ratio wins.
pub const WINDOWS_HOURS: [i64; 2] = [8, 24];
const MAX_INTERVAL_MIN: f64 = 30.0;

#[derive(Debug, Clone, Copy)]
struct WindowRatio {
    hours: i64,
    raw: f64,
    deviations: usize,
}

/// Deviations (mg/dL per 5 min) not explained by insulin, oldest first,
/// skipping intervals while announced carbs are still absorbing.
fn deviations(
    samples: &[GlucoseSample],
    doses: &[InsulinDose],
    curve: &ActivityCurve,
    carbs: &[CarbEntry],
    profile: &Profile,
) -> Vec<f64> {
    let csf = profile.csf();
    let mut meals: Vec<(DateTime<Utc>, f64)> = carbs
        .iter()
        .filter(|c| c.carbs > 0.0)
        .map(|c| (c.at, c.carbs))
        .collect();
    meals.sort_by_key(|m| m.0);
    let mut next_meal = 0;
    let mut cob = 0.0;
    let mut out = Vec::with_capacity(samples.len());
    let offset = profile.basal.utc_offset_minutes();

    for pair in samples.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let dt = minutes_between(prev.date, cur.date);
        if dt <= 0.0 || dt > MAX_INTERVAL_MIN {
            continue;
        }
        while next_meal < meals.len() && meals[next_meal].0 <= cur.date {
            cob += meals[next_meal].1;
            next_meal += 1;
        }
        let delta5 = f64::from(cur.glucose - prev.glucose) / dt * STEP_MINUTES as f64;
        let bgi5 = -calculate_iob(doses, curve, cur.date).activity * profile.sens * STEP_MINUTES as f64;
        let deviation = delta5 - bgi5;

        if cob > 0.0 {
            let absorbed = deviation.max(profile.carbs.min_5m_carbimpact) / csf * dt
                / STEP_MINUTES as f64;
            cob = (cob - absorbed).max(0.0);
            continue;
        }
        out.push(deviation);

        // neutral padding every two hours so long exclusions decay toward 1
        let local = cur.date + Duration::minutes(i64::from(offset));
        if local.hour() % 2 == 0 && local.minute() < 5 {
            out.push(0.0);
        }
    }
    out
}

fn ratio_from(deviations: &[f64], profile: &Profile) -> f64 {
    let mut sorted = deviations.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = percentile(&sorted, 0.5).unwrap_or(0.0);
    let basal_off = median * (60.0 / STEP_MINUTES as f64) / profile.sens;
    let max_daily = profile.basal.max_daily_rate();
    if max_daily <= 0.0 {
        return 1.0;
    }
    1.0 + basal_off / max_daily
}

/// Sensitivity ratio over the 8 h and 24 h windows ending at `now`.
///
/// Fewer than [`MIN_SAMPLES`] readings give ratio 1 with the
/// insufficient-data marker set.
pub fn detect_sensitivity(
    glucose: &[GlucoseSample],
    doses: &[InsulinDose],
    curve: &ActivityCurve,
    carbs: &[CarbEntry],
    profile: &Profile,
    now: DateTime<Utc>,
) -> AutosensResult {
    let horizon = now - Duration::hours(WINDOWS_HOURS[1]);
    let mut samples = clean_samples(glucose);
    samples.retain(|s| s.date <= now && s.date >= horizon);
    samples.reverse();
    if samples.len() < MIN_SAMPLES {
        tracing::debug!(samples = samples.len(), "autosens: not enough glucose data");
        return AutosensResult::insufficient(
            profile.sens,
            format!(
                "not enough glucose data for autosens: {} samples, need {MIN_SAMPLES}",
                samples.len()
            ),
        );
    }

    let windows: Vec<WindowRatio> = WINDOWS_HOURS
        .iter()
        .filter_map(|&hours| {
            let start = now - Duration::hours(hours);
            let from = samples.partition_point(|s| s.date < start);
            let devs = deviations(&samples[from..], doses, curve, carbs, profile);
            (!devs.is_empty()).then(|| WindowRatio {
                hours,
                raw: ratio_from(&devs, profile),
                deviations: devs.len(),
            })
        })
        .collect();

    let Some(best) = windows.iter().copied().min_by(|a, b| a.raw.total_cmp(&b.raw)) else {
        return AutosensResult::neutral(
            profile.sens,
            Some("autosens: every interval excluded for carb absorption".to_string()),
        );
    };

    let ratio = clamp_ratio(best.raw, &profile.sensitivity, "autosens");
    let kind = if ratio > 1.0 {
        "resistant"
    } else if ratio < 1.0 {
        "sensitive"
    } else {
        "normal"
    };
    let summary: Vec<String> = windows
        .iter()
        .map(|w| format!("{}h {:.2}", w.hours, w.raw))
        .collect();
    tracing::debug!(
        window_hours = best.hours,
        deviations = best.deviations,
        pre_clamp = best.raw,
        ratio,
        "autosens"
    );
    AutosensResult {
        ratio,
        pre_clamp_ratio: round_to(best.raw, 2),
        insufficient_data: false,
        reason: Some(format!(
            "autosens ratio {ratio:.2} ({kind}; {})",
            summary.join(", ")
        )),
        adjusted_isf: round_to(profile.sens / ratio, 1),
        adjusted_cr: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InsulinCfg;
    use crate::types::TrendDirection;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap()
    }

    fn trend(n: i64, per_5m: i32) -> Vec<GlucoseSample> {
        (0..n)
            .map(|i| GlucoseSample {
                glucose: 150 - per_5m * i as i32 / 4,
                date: now() - Duration::minutes(i * 5),
                direction: TrendDirection::Flat,
                trend_rate: None,
            })
            .collect()
    }

    fn run(glucose: &[GlucoseSample], carbs: &[CarbEntry]) -> AutosensResult {
        let curve = ActivityCurve::new(&InsulinCfg::default());
        detect_sensitivity(glucose, &[], &curve, carbs, &Profile::default(), now())
    }

    #[test]
    fn under_72_samples_is_neutral_and_flagged() {
        let r = run(&trend(71, 0), &[]);
        assert_eq!(r.ratio, 1.0);
        assert!(r.insufficient_data);
    }

    #[test]
    fn flat_glucose_without_insulin_is_normal() {
        let r = run(&trend(200, 0), &[]);
        assert_eq!(r.ratio, 1.0);
        assert!(!r.insufficient_data);
    }

    #[test]
    fn persistent_rise_means_resistance_up_to_max() {
        // 150 → rising 4 mg/dL per 5 min going forward in time
        let r = run(&trend(200, 16), &[]);
        assert_eq!(r.ratio, Profile::default().sensitivity.autosens_max);
        assert!(r.pre_clamp_ratio > r.ratio);
    }

    #[test]
    fn persistent_fall_means_sensitivity() {
        let r = run(&trend(200, -4), &[]);
        assert!(r.ratio < 1.0);
        assert!(r.ratio >= Profile::default().sensitivity.autosens_min);
        assert!(r.adjusted_isf > Profile::default().sens);
    }
}
