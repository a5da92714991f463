//! Pump delivery model: how long a bolus takes and how much of a temp basal
//! had gone in when it was cut short.

use chrono::Duration;

use crate::fixed_point::round_to_pulses;

/// Delivered units and fractional progress of a dose at some elapsed time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub delivered: f64,
    /// 0..=1
    pub progress: f64,
}

fn secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Time the pump needs to deliver `units` as a bolus.
///
/// Fixed-rate pumps run at 1.5 U/min. Variable-rate pumps slow to 0.75 U/min
/// below 1 U and finish anything above 7.5 U in five minutes.
pub fn bolus_delivery_time(units: f64, variable_rate: bool) -> Duration {
    let units = units.max(0.0);
    let per_minute = if !variable_rate {
        1.5
    } else if units < 1.0 {
        0.75
    } else if units > 7.5 {
        units / 5.0
    } else {
        1.5
    };
    Duration::milliseconds((units / per_minute * 60_000.0).round() as i64)
}

/// Units a temp basal of `rate` U/h delivered after `elapsed`, rounded to
/// whole pump pulses.
pub fn estimate_temp_basal_progress(
    rate: f64,
    duration: Duration,
    elapsed: Duration,
    pulses_per_unit: u32,
) -> Progress {
    let elapsed_s = secs(elapsed).max(0.0);
    let delivered = round_to_pulses(rate.max(0.0) * elapsed_s / 3600.0, pulses_per_unit);
    let total = secs(duration);
    let progress = if total <= 0.0 { 1.0 } else { (elapsed_s / total).min(1.0) };
    Progress { delivered, progress }
}

/// Units of a bolus delivered after `elapsed`, assuming a constant rate
/// over its delivery time.
pub fn estimate_bolus_progress(
    programmed: f64,
    elapsed: Duration,
    variable_rate: bool,
    pulses_per_unit: u32,
) -> Progress {
    let total = secs(bolus_delivery_time(programmed, variable_rate));
    let progress = if total <= 0.0 {
        1.0
    } else {
        (secs(elapsed).max(0.0) / total).min(1.0)
    };
    Progress {
        delivered: round_to_pulses(programmed * progress, pulses_per_unit).min(programmed),
        progress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1.5, false, 60)]
    #[case(0.5, true, 40)]
    #[case(3.0, true, 120)]
    #[case(10.0, true, 300)]
    fn bolus_time(#[case] units: f64, #[case] variable: bool, #[case] secs: i64) {
        assert_eq!(bolus_delivery_time(units, variable), Duration::seconds(secs));
    }

    #[test]
    fn temp_progress_rounds_to_pulses() {
        // 1.0 U/h for 11 minutes = 0.1833 U; 40 pulses/U → 0.175
        let p = estimate_temp_basal_progress(1.0, Duration::minutes(30), Duration::minutes(11), 40);
        assert_eq!(p.delivered, 0.175);
        assert!((p.progress - 11.0 / 30.0).abs() < 1e-9);
        let p20 = estimate_temp_basal_progress(1.0, Duration::minutes(30), Duration::minutes(11), 20);
        assert_eq!(p20.delivered, 0.2);
    }

    #[test]
    fn bolus_progress_caps_at_programmed() {
        let p = estimate_bolus_progress(2.0, Duration::minutes(10), true, 40);
        assert_eq!(p.delivered, 2.0);
        assert_eq!(p.progress, 1.0);
        let half = estimate_bolus_progress(3.0, Duration::seconds(60), true, 40);
        assert_eq!(half.delivered, 1.5);
    }
}
