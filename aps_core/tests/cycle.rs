use std::sync::Arc;

use aps_core::config::Profile;
use aps_core::error::BuildError;
use aps_core::mocks::{
    FailingMiddleware, FixedRatioMiddleware, PanickingMiddleware, ScaleIsfMiddleware,
};
use aps_core::status::DoseState;
use aps_core::suggestion::TempBasal;
use aps_core::{
    ApsError, CycleInputs, EventKind, EventRaw, GlucoseSample, PumpHistoryEvent, UnfinalizedDose,
    run_cycle,
};
use aps_traits::ManualClock;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::rstest;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 2, 9, 0, 0).unwrap()
}

/// Readings every 5 minutes ending `age_min` before now, flat at `bg`.
fn readings(bg: i32, age_min: i64) -> Vec<GlucoseSample> {
    (0..12)
        .map(|i| GlucoseSample {
            glucose: bg,
            date: now() - Duration::minutes(age_min + 5 * i),
            direction: Default::default(),
            trend_rate: None,
        })
        .collect()
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(now()))
}

#[rstest]
fn missing_profile_is_a_typed_build_error() {
    let err = CycleInputs::builder()
        .glucose(readings(120, 0))
        .clock(clock())
        .try_build()
        .expect_err("should fail with MissingProfile");

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingProfile) => {}
        other => panic!("expected MissingProfile, got: {other:?}"),
    }
}

#[rstest]
fn missing_clock_is_a_typed_build_error() {
    let err = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(120, 0))
        .try_build()
        .expect_err("should fail with MissingClock");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::MissingClock)
    ));
}

#[rstest]
#[case::negative_reservoir(-1.0)]
#[case::nan_reservoir(f64::NAN)]
fn invalid_reservoir_is_rejected(#[case] units: f64) {
    let err = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(120, 0))
        .clock(clock())
        .reservoir(units)
        .build()
        .expect_err("reservoir must be validated");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::InvalidConfig(_))
    ));
}

#[test]
fn stale_glucose_yields_fail_safe_cancel() {
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(180, 25))
        .clock(clock())
        .pump_updated_at(now())
        .reservoir(100.0)
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert!(out.suggestion.fail_safe);
    assert_eq!(out.suggestion.temp, Some(TempBasal::CANCEL));
    assert_eq!(out.suggestion.units, None);
    assert!(out.suggestion.reason.contains("min old"));
}

#[test]
fn uncertain_ledger_dose_blocks_dosing() {
    let mut dose = UnfinalizedDose::bolus(2.0, now() - Duration::minutes(40), Duration::seconds(80), true);
    dose.state = DoseState::Uncertain;
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(220, 0))
        .clock(clock())
        .pump_updated_at(now())
        .ledger(vec![dose])
        .microbolus_allowed(true)
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert!(out.suggestion.fail_safe);
    assert_eq!(out.suggestion.units, None);
    assert!(out.suggestion.reason.contains("uncertain"));
    // counted at its programmed amount
    assert!(out.iob.iob > 1.0);
}

#[test]
fn invalid_profile_is_a_config_error() {
    let profile = Profile {
        carb_ratio: 0.05,
        ..Profile::default()
    };
    let inputs = CycleInputs::builder()
        .profile(profile)
        .glucose(readings(120, 0))
        .clock(clock())
        .pump_updated_at(now())
        .build()
        .unwrap();

    let err = run_cycle(&inputs).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApsError>(),
        Some(ApsError::Config(_))
    ));
}

#[rstest]
#[case::panics(Arc::new(PanickingMiddleware) as Arc<dyn aps_core::ProfileMiddleware>, "middleware panicking failed")]
#[case::errors(Arc::new(FailingMiddleware) as Arc<dyn aps_core::ProfileMiddleware>, "middleware failing failed")]
fn broken_middleware_falls_back_to_the_plain_profile(
    #[case] mw: Arc<dyn aps_core::ProfileMiddleware>,
    #[case] note: &str,
) {
    let plain = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(140, 0))
        .clock(clock())
        .pump_updated_at(now())
        .build()
        .unwrap();
    let with_mw = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(140, 0))
        .clock(clock())
        .pump_updated_at(now())
        .middleware(mw)
        .build()
        .unwrap();

    let a = run_cycle(&plain).unwrap().suggestion;
    let b = run_cycle(&with_mw).unwrap().suggestion;
    assert!(b.reason.contains(note), "reason was: {}", b.reason);
    assert_eq!(a.temp, b.temp);
    assert_eq!(a.isf, b.isf);
    assert!(!b.fail_safe);
}

#[test]
fn middleware_changes_reach_the_decision() {
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(140, 0))
        .clock(clock())
        .pump_updated_at(now())
        .middleware(Arc::new(ScaleIsfMiddleware(2.0)))
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert_eq!(out.suggestion.isf, Some(100.0));
    assert!(out.suggestion.reason.contains("ISF x2"));
}

#[test]
fn old_pump_history_without_refresh_time_fails_safe() {
    let old = now() - Duration::hours(3);
    let history = vec![PumpHistoryEvent {
        raw: EventRaw(vec![1, 2, 3]),
        timestamp: old,
        kind: EventKind::TempBasal { rate: 1.5 },
    }];
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(160, 0))
        .clock(clock())
        .history(history)
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert!(out.suggestion.fail_safe);
    assert_eq!(out.suggestion.temp, Some(TempBasal::CANCEL));
    assert!(out.suggestion.reason.contains("pump history is 180 min old"));
}

#[test]
fn no_pump_contact_at_all_fails_safe() {
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(160, 0))
        .clock(clock())
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert!(out.suggestion.fail_safe);
    assert!(out.suggestion.reason.contains("no pump history"));
}

#[test]
fn recent_ledger_dose_counts_as_pump_contact() {
    let dose = UnfinalizedDose::temp_basal(1.0, now() - Duration::minutes(5), Duration::minutes(30), true);
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(160, 0))
        .clock(clock())
        .ledger(vec![dose])
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert!(!out.suggestion.fail_safe, "reason: {}", out.suggestion.reason);
}

#[rstest]
#[case::too_high(5.0, 1.2)]
#[case::too_low(0.1, 0.7)]
fn middleware_ratio_is_held_to_configured_bounds(#[case] set: f64, #[case] expected: f64) {
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(140, 0))
        .clock(clock())
        .pump_updated_at(now())
        .middleware(Arc::new(FixedRatioMiddleware(set)))
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert_eq!(out.suggestion.sensitivity_ratio, expected);
    assert_eq!(out.suggestion.isf, Some((50.0 / expected * 10.0_f64).round() / 10.0));
    assert!(!out.suggestion.fail_safe);
}

#[test]
fn non_finite_middleware_ratio_falls_back() {
    let inputs = CycleInputs::builder()
        .profile(Profile::default())
        .glucose(readings(140, 0))
        .clock(clock())
        .pump_updated_at(now())
        .middleware(Arc::new(FixedRatioMiddleware(f64::NAN)))
        .build()
        .unwrap();

    let out = run_cycle(&inputs).unwrap();
    assert_eq!(out.suggestion.sensitivity_ratio, 1.0);
    assert_eq!(out.suggestion.isf, Some(50.0));
    assert!(out.suggestion.reason.contains("middleware fixed_ratio failed"));
}
