//! Current glucose and its recent rate of change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GlucoseSample, TrendDirection};
use crate::util::{minutes_between, round_to};

/// Values at or below this are sensor error codes, not glucose.
pub const SENSOR_ERROR_MAX: i32 = 38;
/// Samples closer than this are the same reading.
const DUPLICATE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseStatus {
    /// mg/dL, averaged with any reading in the last 2.5 minutes.
    pub glucose: f64,
    pub date: DateTime<Utc>,
    /// mg/dL per 5 min versus ~5 minutes ago.
    pub delta: f64,
    /// Average 5-minute delta over 2.5–17.5 minutes ago.
    pub short_avg_delta: f64,
    /// Average 5-minute delta over 17.5–42.5 minutes ago.
    pub long_avg_delta: f64,
    pub direction: TrendDirection,
}

/// Drop sensor error codes and duplicates; newest first.
pub fn clean_samples(samples: &[GlucoseSample]) -> Vec<GlucoseSample> {
    let mut out: Vec<GlucoseSample> = samples
        .iter()
        .filter(|s| s.glucose > SENSOR_ERROR_MAX)
        .copied()
        .collect();
    out.sort_by(|a, b| b.date.cmp(&a.date));
    out.dedup_by(|later, kept| (kept.date - later.date).num_seconds().abs() < DUPLICATE_SECS);
    out
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

impl GlucoseStatus {
    /// Status from raw samples in any order; `None` if no valid reading exists.
    pub fn from_samples(samples: &[GlucoseSample]) -> Option<Self> {
        let clean = clean_samples(samples);
        let latest = clean.first()?;
        let mut now_bg = f64::from(latest.glucose);
        let now_date = latest.date;

        let mut last = Vec::new();
        let mut short = Vec::new();
        let mut long = Vec::new();
        for s in clean.iter().skip(1) {
            let ago = minutes_between(s.date, now_date);
            if ago < 2.5 {
                now_bg = f64::midpoint(now_bg, f64::from(s.glucose));
                continue;
            }
            let avg_delta = (now_bg - f64::from(s.glucose)) / ago * 5.0;
            if ago < 7.5 {
                last.push(avg_delta);
            }
            if ago < 17.5 {
                short.push(avg_delta);
            } else if ago < 42.5 {
                long.push(avg_delta);
            } else {
                break;
            }
        }

        Some(Self {
            glucose: now_bg,
            date: now_date,
            delta: round_to(mean(&last), 2),
            short_avg_delta: round_to(mean(&short), 2),
            long_avg_delta: round_to(mean(&long), 2),
            direction: latest.direction,
        })
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        minutes_between(self.date, now)
    }

    /// Older than `max_age_min`, or implausibly far in the future.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_min: f64) -> bool {
        let age = self.age_minutes(now);
        age > max_age_min || age < -max_age_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(min_ago: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap() - Duration::minutes(min_ago)
    }

    fn s(min_ago: i64, glucose: i32) -> GlucoseSample {
        GlucoseSample {
            glucose,
            date: t(min_ago),
            direction: TrendDirection::Flat,
            trend_rate: None,
        }
    }

    #[test]
    fn steady_rise_gives_equal_deltas() {
        let samples: Vec<_> = (0..10).map(|i| s(i * 5, 150 - (i as i32) * 5)).collect();
        let st = GlucoseStatus::from_samples(&samples).unwrap();
        assert_eq!(st.glucose, 150.0);
        assert_eq!(st.delta, 5.0);
        assert_eq!(st.short_avg_delta, 5.0);
        assert_eq!(st.long_avg_delta, 5.0);
    }

    #[test]
    fn error_codes_and_duplicates_dropped() {
        let samples = vec![s(0, 38), s(5, 120), s(5, 120), s(10, 115)];
        let clean = clean_samples(&samples);
        assert_eq!(clean.len(), 2);
        let st = GlucoseStatus::from_samples(&samples).unwrap();
        assert_eq!(st.date, t(5));
        assert_eq!(st.delta, 5.0);
    }

    #[test]
    fn only_error_codes_is_none() {
        assert!(GlucoseStatus::from_samples(&[s(0, 10), s(5, 38)]).is_none());
    }

    #[test]
    fn staleness() {
        let st = GlucoseStatus::from_samples(&[s(13, 100)]).unwrap();
        assert!(st.is_stale(t(0), 12.0));
        assert!(!st.is_stale(t(2), 12.0));
    }
}
