//! Insulin on board.
//!
//! Net doses from the [`DoseTimeline`](crate::history::DoseTimeline) are
//! convolved with an [`ActivityCurve`]; the result is a snapshot at a given
//! instant or a 4 h trajectory sampled every 5 minutes.

pub mod curve;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use curve::ActivityCurve;

use crate::history::{DoseSource, InsulinDose};
use crate::util::{STEP_MINUTES, minutes_between, round_to};

/// Samples after "now" in a trajectory (4 h at 5 min).
pub const TRAJECTORY_STEPS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IobSnapshot {
    pub time: DateTime<Utc>,
    /// Units on board, net of scheduled basal.
    pub iob: f64,
    /// Units absorbed per minute.
    pub activity: f64,
    pub basal_iob: f64,
    pub bolus_iob: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bolus_time: Option<DateTime<Utc>>,
}

impl IobSnapshot {
    pub fn empty(time: DateTime<Utc>) -> Self {
        Self {
            time,
            iob: 0.0,
            activity: 0.0,
            basal_iob: 0.0,
            bolus_iob: 0.0,
            last_bolus_time: None,
        }
    }
}

/// IOB and activity at `at` from every dose delivered at or before it.
pub fn calculate_iob(
    doses: &[InsulinDose],
    curve: &ActivityCurve,
    at: DateTime<Utc>,
) -> IobSnapshot {
    let mut snap = IobSnapshot::empty(at);
    for dose in doses.iter().filter(|d| d.at <= at) {
        let t = minutes_between(dose.at, at);
        let remaining = dose.units * curve.iob_fraction(t);
        snap.activity += dose.units * curve.activity(t);
        snap.iob += remaining;
        match dose.source {
            DoseSource::Bolus => {
                snap.bolus_iob += remaining;
                snap.last_bolus_time = Some(dose.at);
            }
            DoseSource::Basal => snap.basal_iob += remaining,
        }
    }
    snap.iob = round_to(snap.iob, 3);
    snap.basal_iob = round_to(snap.basal_iob, 3);
    snap.bolus_iob = round_to(snap.bolus_iob, 3);
    snap.activity = round_to(snap.activity, 4);
    snap
}

/// `TRAJECTORY_STEPS + 1` snapshots starting at `now`, 5 minutes apart.
///
/// The first element is the current IOB; later ones assume no new dosing.
pub fn iob_trajectory(
    doses: &[InsulinDose],
    curve: &ActivityCurve,
    now: DateTime<Utc>,
) -> Vec<IobSnapshot> {
    (0..=TRAJECTORY_STEPS as i64)
        .map(|i| calculate_iob(doses, curve, now + Duration::minutes(i * STEP_MINUTES)))
        .collect()
}

/// Blood glucose impact per 5-minute step for each trajectory sample (mg/dL).
pub fn glucose_effects(trajectory: &[IobSnapshot], sens: f64) -> Vec<f64> {
    trajectory
        .iter()
        .map(|s| round_to(-s.activity * sens * STEP_MINUTES as f64, 2))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CurveKind, InsulinCfg};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap()
    }

    fn bolus(min_ago: i64, units: f64) -> InsulinDose {
        InsulinDose {
            at: now() - Duration::minutes(min_ago),
            units,
            source: DoseSource::Bolus,
        }
    }

    fn rapid() -> ActivityCurve {
        ActivityCurve::new(&InsulinCfg {
            curve: CurveKind::RapidActing,
            dia_hours: 6.0,
            custom_peak_minutes: None,
        })
    }

    #[test]
    fn fresh_bolus_fully_on_board() {
        let s = calculate_iob(&[bolus(0, 2.0)], &rapid(), now());
        assert!((s.iob - 2.0).abs() < 1e-3);
        assert_eq!(s.bolus_iob, s.iob);
        assert_eq!(s.basal_iob, 0.0);
        assert_eq!(s.last_bolus_time, Some(now()));
    }

    #[test]
    fn expired_and_future_doses_contribute_nothing() {
        let doses = [bolus(400, 3.0), bolus(-10, 1.0)];
        let s = calculate_iob(&doses, &rapid(), now());
        assert_eq!(s.iob, 0.0);
        assert_eq!(s.activity, 0.0);
    }

    #[test]
    fn negative_basal_reduces_iob() {
        let doses = [
            bolus(30, 1.0),
            InsulinDose {
                at: now() - Duration::minutes(20),
                units: -0.5,
                source: DoseSource::Basal,
            },
        ];
        let s = calculate_iob(&doses, &rapid(), now());
        assert!(s.basal_iob < 0.0);
        assert!((s.iob - (s.basal_iob + s.bolus_iob)).abs() < 2e-3);
    }

    #[test]
    fn trajectory_decays_over_four_hours() {
        let traj = iob_trajectory(&[bolus(10, 2.0)], &rapid(), now());
        assert_eq!(traj.len(), 49);
        assert_eq!(traj[48].time - traj[0].time, Duration::hours(4));
        assert!(traj.windows(2).all(|w| w[1].iob <= w[0].iob));
        let bgi = glucose_effects(&traj, 50.0);
        assert!(bgi.iter().all(|b| *b <= 0.0));
    }
}
