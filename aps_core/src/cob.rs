//! Carbs on board.
//!
//! Absorption is inferred from glucose: whatever rise the insulin activity
//! does not explain is attributed to carbs, floored at a minimum rate and
//! capped by how fast the entries can physically absorb.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Profile;
use crate::glucose::clean_samples;
use crate::history::InsulinDose;
use crate::iob::{ActivityCurve, calculate_iob};
use crate::types::{CarbEntry, GlucoseSample};
use crate::util::{STEP_MINUTES, minutes_between, round_to};

/// Entries older than this no longer count.
pub const CARB_WINDOW_HOURS: i64 = 6;
/// Fewer glucose samples than this yields COB = 0.
pub const MIN_SAMPLES: usize = 4;
/// Intervals longer than this are treated as a sensor gap.
const MAX_INTERVAL_MIN: f64 = 30.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CobResult {
    /// Grams still to absorb.
    pub cob: f64,
    /// Grams entered within the carb window.
    pub carbs_in_window: f64,
    pub absorbed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_carb_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_since_last_carbs: Option<f64>,
    /// mg/dL per 5 min unexplained by insulin, latest interval.
    pub current_deviation: f64,
    pub max_deviation: f64,
    pub min_deviation: f64,
    pub insufficient_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CobResult {
    fn insufficient(reason: String) -> Self {
        Self {
            insufficient_data: true,
            reason: Some(reason),
            ..Self::default()
        }
    }
}

struct Remaining {
    at: DateTime<Utc>,
    grams: f64,
    max_per_5m: f64,
}

/// Carbs on board at `now`.
///
/// `doses` and `curve` must be the same ones used for IOB so the deviation
/// is measured against the insulin effect the controller predicts.
pub fn calculate_cob(
    carbs: &[CarbEntry],
    glucose: &[GlucoseSample],
    doses: &[InsulinDose],
    curve: &ActivityCurve,
    profile: &Profile,
    now: DateTime<Utc>,
) -> CobResult {
    let window_start = now - Duration::hours(CARB_WINDOW_HOURS);
    let mut entries: Vec<&CarbEntry> = carbs
        .iter()
        .filter(|c| c.carbs > 0.0 && c.at <= now && c.at >= window_start)
        .collect();
    entries.sort_by_key(|c| c.at);

    let mut samples = clean_samples(glucose);
    samples.retain(|s| s.date <= now);
    if samples.len() < MIN_SAMPLES {
        tracing::debug!(samples = samples.len(), "not enough glucose data for COB");
        return CobResult::insufficient(format!(
            "not enough glucose data for COB: {} samples, need {MIN_SAMPLES}",
            samples.len()
        ));
    }
    samples.reverse();

    let sens = profile.sens;
    let csf = profile.csf();
    let carbs_cfg = &profile.carbs;
    let mut remaining: Vec<Remaining> = entries
        .iter()
        .map(|c| {
            let hours = c
                .absorption_hours
                .filter(|h| *h > 0.0)
                .unwrap_or(carbs_cfg.default_absorption_hours);
            Remaining {
                at: c.at,
                grams: c.carbs,
                max_per_5m: c.carbs / (hours * 12.0) * carbs_cfg.max_absorption_factor,
            }
        })
        .collect();

    let first_carbs = entries.first().map(|c| c.at);
    let mut current_deviation = 0.0;
    let mut max_deviation = 0.0_f64;
    let mut min_deviation = 0.0_f64;
    let mut absorbed_total = 0.0;

    for pair in samples.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let dt = minutes_between(prev.date, cur.date);
        if dt <= 0.0 || dt > MAX_INTERVAL_MIN {
            continue;
        }
        let delta5 = f64::from(cur.glucose - prev.glucose) / dt * STEP_MINUTES as f64;
        let activity = calculate_iob(doses, curve, cur.date).activity;
        let bgi5 = -activity * sens * STEP_MINUTES as f64;
        let deviation = delta5 - bgi5;
        current_deviation = deviation;

        if first_carbs.is_none_or(|f| cur.date <= f) {
            continue;
        }
        max_deviation = max_deviation.max(deviation);
        min_deviation = min_deviation.min(deviation);

        let cap: f64 = remaining
            .iter()
            .filter(|r| r.at < cur.date && r.grams > 0.0)
            .map(|r| r.max_per_5m)
            .sum();
        if cap <= 0.0 {
            continue;
        }
        let rate = (deviation.max(carbs_cfg.min_5m_carbimpact) / csf).min(cap);
        let mut to_absorb = rate * dt / STEP_MINUTES as f64;
        for r in remaining.iter_mut().filter(|r| r.at < cur.date) {
            if to_absorb <= 0.0 {
                break;
            }
            let take = r.grams.min(to_absorb);
            r.grams -= take;
            to_absorb -= take;
            absorbed_total += take;
        }
    }

    let cob_raw: f64 = remaining.iter().map(|r| r.grams.max(0.0)).sum();
    let cob = cob_raw.min(carbs_cfg.max_cob);
    if cob < cob_raw {
        tracing::debug!(cob_raw, max_cob = carbs_cfg.max_cob, "COB capped");
    }
    let last = entries.last().map(|c| c.at);
    CobResult {
        cob: round_to(cob, 1),
        carbs_in_window: entries.iter().map(|c| c.carbs).sum(),
        absorbed: round_to(absorbed_total, 1),
        last_carb_time: last,
        minutes_since_last_carbs: last.map(|t| round_to(minutes_between(t, now), 1)),
        current_deviation: round_to(current_deviation, 2),
        max_deviation: round_to(max_deviation, 2),
        min_deviation: round_to(min_deviation, 2),
        insufficient_data: false,
        reason: None,
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

    fn flat_bg(n: i64, bg: i32) -> Vec<GlucoseSample> {
        (0..n)
            .map(|i| GlucoseSample {
                glucose: bg,
                date: now() - Duration::minutes(i * 5),
                direction: TrendDirection::Flat,
                trend_rate: None,
            })
            .collect()
    }

    fn meal(min_ago: i64, grams: f64) -> CarbEntry {
        CarbEntry {
            at: now() - Duration::minutes(min_ago),
            carbs: grams,
            absorption_hours: None,
        }
    }

    fn curve() -> ActivityCurve {
        ActivityCurve::new(&InsulinCfg::default())
    }

    #[test]
    fn fewer_than_four_samples_is_zero_with_reason() {
        let r = calculate_cob(
            &[meal(10, 40.0)],
            &flat_bg(3, 110),
            &[],
            &curve(),
            &Profile::default(),
            now(),
        );
        assert_eq!(r.cob, 0.0);
        assert!(r.insufficient_data);
        assert!(r.reason.unwrap().contains("not enough"));
    }

    #[test]
    fn flat_glucose_absorbs_at_minimum_rate() {
        let profile = Profile::default();
        let r = calculate_cob(
            &[meal(60, 50.0)],
            &flat_bg(24, 110),
            &[],
            &curve(),
            &profile,
            now(),
        );
        // 8 mg/dL per 5 min floor at csf 5 → 1.6 g per 5 min, 12 intervals since the meal
        let expected = 50.0 - 1.6 * 12.0;
        assert!((r.cob - expected).abs() < 0.2, "cob {}", r.cob);
        assert_eq!(r.minutes_since_last_carbs, Some(60.0));
    }

    #[test]
    fn cob_capped_by_max_cob() {
        let mut profile = Profile::default();
        profile.carbs.max_cob = 30.0;
        let r = calculate_cob(
            &[meal(0, 80.0)],
            &flat_bg(6, 110),
            &[],
            &curve(),
            &profile,
            now(),
        );
        assert_eq!(r.cob, 30.0);
    }

    #[test]
    fn old_entries_ignored() {
        let r = calculate_cob(
            &[meal(7 * 60, 80.0)],
            &flat_bg(6, 110),
            &[],
            &curve(),
            &Profile::default(),
            now(),
        );
        assert_eq!(r.cob, 0.0);
        assert_eq!(r.carbs_in_window, 0.0);
        assert!(!r.insufficient_data);
    }
}
