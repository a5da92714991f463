//! Total daily dose from the dose timeline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BasalSchedule, Profile};
use crate::fixed_point::{accounting_increment, floor_to_increment};
use crate::history::DoseTimeline;
use crate::util::{minutes_between, round_to};

/// History needed before the weighted average is trusted.
pub const RELIABLE_HOURS: f64 = 23.0;
/// Longest history the daily average looks at.
pub const MAX_AVERAGE_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TddSummary {
    /// Units over the last 24 h.
    pub total_24h: f64,
    pub bolus_24h: f64,
    pub temp_basal_24h: f64,
    pub scheduled_basal_24h: f64,
    /// Units over the last 2 h, scaled to a day.
    pub extrapolated_2h: f64,
    /// Mean daily units over the available history, up to 14 days.
    pub average_daily: f64,
    pub weighted_average: f64,
    pub hours_covered: f64,
    pub reliable: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Split {
    bolus: f64,
    temp: f64,
    scheduled: f64,
}

impl Split {
    fn total(&self) -> f64 {
        self.bolus + self.temp + self.scheduled
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TddCalculator {
    increment: f64,
    weight: f64,
}

impl TddCalculator {
    pub fn new(profile: &Profile) -> Self {
        Self {
            increment: accounting_increment(profile.smb.bolus_increment),
            weight: profile.dynamic_isf.weight_percentage,
        }
    }

    fn split(
        &self,
        timeline: &DoseTimeline,
        basal: &BasalSchedule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Split {
        let mut s = Split {
            bolus: timeline
                .bolus_doses()
                .iter()
                .filter(|b| b.at >= from && b.at < to)
                .map(|b| floor_to_increment(b.units, self.increment))
                .sum(),
            ..Split::default()
        };
        for piece in timeline.delivery_pieces(basal, from, to) {
            let units = floor_to_increment(piece.units(), self.increment);
            if piece.scheduled {
                s.scheduled += units;
            } else {
                s.temp += units;
            }
        }
        s
    }

    /// Summarize delivery up to `now`.
    ///
    /// `history_start` is when the records begin; it defaults to the
    /// earliest delivery on the timeline. Scheduled basal is only counted
    /// from that point on.
    pub fn calculate(
        &self,
        timeline: &DoseTimeline,
        basal: &BasalSchedule,
        history_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> TddSummary {
        let Some(start) = history_start.or_else(|| timeline.earliest()) else {
            return TddSummary::default();
        };
        let start = start.max(now - Duration::days(MAX_AVERAGE_DAYS));
        if start >= now {
            return TddSummary::default();
        }
        let hours_covered = minutes_between(start, now) / 60.0;

        let day = self.split(timeline, basal, start.max(now - Duration::hours(24)), now);
        let recent = self.split(timeline, basal, start.max(now - Duration::hours(2)), now);
        let all = self.split(timeline, basal, start, now);

        let average_daily = all.total() / (hours_covered / 24.0).max(1.0);
        let extrapolated_2h = recent.total() * 12.0;
        let weighted = self.weight * extrapolated_2h + (1.0 - self.weight) * average_daily;
        let reliable = hours_covered >= RELIABLE_HOURS;
        if !reliable {
            tracing::debug!(hours_covered, "TDD history shorter than a day");
        }
        TddSummary {
            total_24h: round_to(day.total(), 2),
            bolus_24h: round_to(day.bolus, 2),
            temp_basal_24h: round_to(day.temp, 2),
            scheduled_basal_24h: round_to(day.scheduled, 2),
            extrapolated_2h: round_to(extrapolated_2h, 2),
            average_daily: round_to(average_daily, 2),
            weighted_average: round_to(weighted, 2),
            hours_covered: round_to(hours_covered, 2),
            reliable,
        }
    }
}
