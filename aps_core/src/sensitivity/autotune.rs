//! Autotune: offline adjustment of basal, ISF and carb ratio from several
//! days of data.
//!
//! Each 5-minute interval is categorized by what most likely drove the
//! glucose change (carbs, a dominant bolus, or basal alone) and each
//! category nudges its own parameter. One iteration runs per day, oldest
//! first; every result stays within `[autosens_min, autosens_max]` of the
//! pump profile.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BasalEntry, BasalSchedule, Profile};
use crate::error::ApsError;
use crate::glucose::clean_samples;
use crate::history::InsulinDose;
use crate::iob::{ActivityCurve, calculate_iob};
use crate::types::{CarbEntry, GlucoseSample};
use crate::util::{STEP_MINUTES, clamp_f64, minutes_between, percentile, round_to};

/// Share of the observed basal gap applied per day.
const BASAL_STEP: f64 = 0.2;
/// Share of the observed ISF/CR moved toward per day.
const RATIO_STEP: f64 = 0.1;
/// Hours before the deviation that receive the basal change.
const BASAL_LEAD_HOURS: usize = 3;
/// A bolus dominates when its impact exceeds this multiple of basal's.
const ISF_DOMINANCE: f64 = 4.0;
const MAX_INTERVAL_MIN: f64 = 30.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointCounts {
    pub basal: usize,
    pub isf: usize,
    pub csf: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutotuneResult {
    /// 24 hourly rates, U/h, local time.
    pub hourly_basal: Vec<f64>,
    pub sens: f64,
    pub carb_ratio: f64,
    pub days: usize,
    pub points: PointCounts,
    /// One line per adjustment.
    pub log: Vec<String>,
}

impl AutotuneResult {
    /// `base` with the tuned basal, ISF and carb ratio.
    pub fn apply_to(&self, base: &Profile) -> Result<Profile, ApsError> {
        let entries = self
            .hourly_basal
            .iter()
            .enumerate()
            .map(|(h, &rate)| BasalEntry {
                minutes: u32::try_from(h * 60).unwrap_or(0),
                rate,
            })
            .collect();
        let basal = BasalSchedule::new(entries, base.basal.utc_offset_minutes())?;
        let mut tuned = base.clone();
        tuned.basal = basal;
        tuned.sens = self.sens;
        tuned.carb_ratio = self.carb_ratio;
        tuned.validate()?;
        Ok(tuned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Basal,
    Isf,
    Csf,
}

struct Point {
    hour: usize,
    deviation: f64,
    bgi: f64,
    category: Category,
}

#[derive(Debug, Clone)]
struct Tuned {
    hourly: Vec<f64>,
    sens: f64,
    carb_ratio: f64,
}

/// Rate at the start of each local hour.
fn hourly_rates(schedule: &BasalSchedule) -> Vec<f64> {
    (0..24u32)
        .map(|h| {
            schedule
                .entries()
                .iter()
                .rev()
                .find(|e| e.minutes <= h * 60)
                .map_or(0.0, |e| e.rate)
        })
        .collect()
}

fn local_hour(t: DateTime<Utc>, offset_min: i32) -> usize {
    (t + Duration::minutes(i64::from(offset_min))).hour() as usize
}

fn categorize(
    samples: &[GlucoseSample],
    doses: &[InsulinDose],
    curve: &ActivityCurve,
    carbs: &[CarbEntry],
    profile: &Profile,
    tuned: &Tuned,
) -> Vec<Point> {
    let offset = profile.basal.utc_offset_minutes();
    let mut meals: Vec<&CarbEntry> = carbs.iter().filter(|c| c.carbs > 0.0).collect();
    meals.sort_by_key(|c| c.at);
    let mut next_meal = 0;
    let mut cob = 0.0;
    let csf = tuned.sens / tuned.carb_ratio;
    let mut out = Vec::new();

    for pair in samples.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let dt = minutes_between(prev.date, cur.date);
        if dt <= 0.0 || dt > MAX_INTERVAL_MIN {
            continue;
        }
        while next_meal < meals.len() && meals[next_meal].at <= cur.date {
            cob += meals[next_meal].carbs;
            next_meal += 1;
        }
        let hour = local_hour(cur.date, offset);
        let delta5 = f64::from(cur.glucose - prev.glucose) / dt * STEP_MINUTES as f64;
        let bgi = -calculate_iob(doses, curve, cur.date).activity * tuned.sens * STEP_MINUTES as f64;
        let basal_bgi = tuned.hourly[hour] * tuned.sens / 60.0 * STEP_MINUTES as f64;
        let deviation = delta5 - bgi;

        let category = if cob > 0.0 {
            let absorbed =
                deviation.max(profile.carbs.min_5m_carbimpact) / csf * dt / STEP_MINUTES as f64;
            cob = (cob - absorbed).max(0.0);
            Category::Csf
        } else if -bgi > ISF_DOMINANCE * basal_bgi {
            Category::Isf
        } else {
            Category::Basal
        };
        out.push(Point {
            hour,
            deviation,
            bgi,
            category,
        });
    }
    out
}

fn tune_day(
    points: &[Point],
    carbs_in_day: f64,
    pump: &Profile,
    pump_hourly: &[f64],
    tuned: &mut Tuned,
    log: &mut Vec<String>,
) {
    let (lo, hi) = (pump.sensitivity.autosens_min, pump.sensitivity.autosens_max);

    // basal
    let mut needed = [0.0_f64; 24];
    for p in points.iter().filter(|p| p.category == Category::Basal) {
        needed[p.hour] += p.deviation;
    }
    let mut new_hourly = tuned.hourly.clone();
    for (hour, sum_dev) in needed.iter().enumerate() {
        if *sum_dev == 0.0 {
            continue;
        }
        let units = BASAL_STEP * sum_dev / tuned.sens;
        for lead in 1..=BASAL_LEAD_HOURS {
            let h = (hour + 24 - lead) % 24;
            new_hourly[h] += units / BASAL_LEAD_HOURS as f64;
        }
    }
    for (h, rate) in new_hourly.iter_mut().enumerate() {
        let pump_rate = pump_hourly.get(h).copied().unwrap_or(*rate);
        let capped = clamp_f64(*rate, pump_rate * lo, pump_rate * hi);
        if (capped - *rate).abs() > 1e-9 {
            log.push(format!("basal {h:02}:00 capped at {capped:.3} (wanted {rate:.3})"));
        }
        *rate = round_to(capped.max(0.0), 3);
    }
    tuned.hourly = new_hourly;

    // ISF: observed ratio of actual to expected drop while bolus insulin dominates
    let mut ratios: Vec<f64> = points
        .iter()
        .filter(|p| p.category == Category::Isf && p.bgi < 0.0)
        .map(|p| 1.0 + p.deviation / p.bgi)
        .filter(|r| r.is_finite() && *r > 0.0)
        .collect();
    ratios.sort_by(f64::total_cmp);
    if let Some(median) = percentile(&ratios, 0.5) {
        let full = tuned.sens * median;
        let moved = (1.0 - RATIO_STEP) * tuned.sens + RATIO_STEP * full;
        let capped = clamp_f64(moved, pump.sens / hi, pump.sens / lo);
        log.push(format!("ISF {:.1} → {capped:.1} ({} points)", tuned.sens, ratios.len()));
        tuned.sens = round_to(capped, 1);
    }

    // CR: unexplained rise per gram while carbs absorb
    let rise: f64 = points
        .iter()
        .filter(|p| p.category == Category::Csf)
        .map(|p| p.deviation)
        .sum();
    if carbs_in_day > 0.0 && rise > 0.0 {
        let observed_csf = rise / carbs_in_day;
        let full = tuned.sens / observed_csf;
        let moved = (1.0 - RATIO_STEP) * tuned.carb_ratio + RATIO_STEP * full;
        let capped = clamp_f64(moved, pump.carb_ratio / hi, pump.carb_ratio / lo);
        log.push(format!("CR {:.1} → {capped:.1}", tuned.carb_ratio));
        tuned.carb_ratio = round_to(capped, 1);
    }
}

/// Tune `pump` against every whole day of data ending at `now`.
pub fn autotune(
    pump: &Profile,
    glucose: &[GlucoseSample],
    doses: &[InsulinDose],
    curve: &ActivityCurve,
    carbs: &[CarbEntry],
    now: DateTime<Utc>,
) -> Result<AutotuneResult, ApsError> {
    let mut samples = clean_samples(glucose);
    samples.retain(|s| s.date <= now);
    samples.reverse();
    let Some(first) = samples.first().map(|s| s.date) else {
        return Err(ApsError::InvalidInput("autotune needs glucose data".into()));
    };
    let days = (now - first).num_days().max(0) as usize;
    if days == 0 {
        return Err(ApsError::InvalidInput(
            "autotune needs at least one full day of glucose data".into(),
        ));
    }

    let pump_hourly = hourly_rates(&pump.basal);
    let mut tuned = Tuned {
        hourly: pump_hourly.clone(),
        sens: pump.sens,
        carb_ratio: pump.carb_ratio,
    };
    let mut log = Vec::new();
    let mut counts = PointCounts::default();
    for d in (0..days).rev() {
        let end = now - Duration::days(d as i64);
        let start = end - Duration::days(1);
        let from = samples.partition_point(|s| s.date < start);
        let to = samples.partition_point(|s| s.date < end);
        let day_carbs: Vec<CarbEntry> = carbs
            .iter()
            .filter(|c| c.at >= start && c.at < end)
            .copied()
            .collect();
        let points = categorize(&samples[from..to], doses, curve, &day_carbs, pump, &tuned);
        for p in &points {
            match p.category {
                Category::Basal => counts.basal += 1,
                Category::Isf => counts.isf += 1,
                Category::Csf => counts.csf += 1,
            }
        }
        let grams = day_carbs.iter().map(|c| c.carbs).sum();
        tune_day(&points, grams, pump, &pump_hourly, &mut tuned, &mut log);
        tracing::debug!(
            day = days - d,
            points = points.len(),
            sens = tuned.sens,
            cr = tuned.carb_ratio,
            "autotune iteration"
        );
    }

    tracing::info!(days, sens = tuned.sens, carb_ratio = tuned.carb_ratio, "autotune finished");
    Ok(AutotuneResult {
        hourly_basal: tuned.hourly,
        sens: tuned.sens,
        carb_ratio: tuned.carb_ratio,
        days,
        points: counts,
        log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InsulinCfg;
    use crate::types::TrendDirection;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 3, 0, 0, 0).unwrap()
    }

    fn days_of(days: i64, f: impl Fn(i64) -> i32) -> Vec<GlucoseSample> {
        (0..days * 288)
            .map(|i| GlucoseSample {
                glucose: f(i),
                date: now() - Duration::minutes(i * 5),
                direction: TrendDirection::Flat,
                trend_rate: None,
            })
            .collect()
    }

    fn curve() -> ActivityCurve {
        ActivityCurve::new(&InsulinCfg::default())
    }

    #[test]
    fn flat_glucose_keeps_profile() {
        let p = Profile::default();
        let r = autotune(&p, &days_of(2, |_| 110), &[], &curve(), &[], now()).unwrap();
        assert_eq!(r.days, 1);
        assert!(r.hourly_basal.iter().all(|b| (*b - 1.0).abs() < 1e-9));
        assert_eq!(r.sens, p.sens);
        assert_eq!(r.carb_ratio, p.carb_ratio);
    }

    #[test]
    fn rising_glucose_raises_basal_within_cap() {
        let p = Profile::default();
        // going forward in time glucose rises ~1 mg/dL per 5 min, sawtooth to stay in range
        let g = days_of(3, |i| 200 - (i % 100) as i32);
        let r = autotune(&p, &g, &[], &curve(), &[], now()).unwrap();
        assert!(r.hourly_basal.iter().any(|b| *b > 1.0));
        assert!(r.hourly_basal.iter().all(|b| *b <= p.sensitivity.autosens_max + 1e-9));
        let tuned = r.apply_to(&p).unwrap();
        assert_eq!(tuned.basal.entries().len(), 24);
    }

    #[test]
    fn no_glucose_is_invalid_input() {
        let err = autotune(&Profile::default(), &[], &[], &curve(), &[], now()).unwrap_err();
        assert!(matches!(err, ApsError::InvalidInput(_)));
    }
}
