#![no_main]
use aps_core::config::ReconcileCfg;
use aps_core::{PendingLedger, PumpHistoryEvent, UnfinalizedDose};
use chrono::{Duration, TimeZone, Utc};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(events) = serde_json::from_slice::<Vec<PumpHistoryEvent>>(data) else {
        return;
    };
    let Some(t0) = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).single() else {
        return;
    };

    let mut ledger = PendingLedger::new(ReconcileCfg::default());
    for (i, units) in [0.5, 1.0, 2.5].into_iter().enumerate() {
        let at = t0 + Duration::minutes(5 * i as i64);
        let _ = ledger.record(UnfinalizedDose::bolus(units, at, Duration::seconds(40), false));
    }
    let _ = ledger.record(UnfinalizedDose::temp_basal(1.2, t0, Duration::minutes(30), true));

    let before = serde_json::to_value(&ledger).ok();
    let now = t0 + Duration::hours(1);
    match ledger.reconcile(&events, now) {
        Ok(_) => {
            for d in ledger.doses() {
                assert!(d.delivered_units <= d.programmed_units + 1e-9);
                assert!(d.delivered_units >= 0.0);
            }
            // Feeding the same batch twice changes nothing.
            let settled = serde_json::to_value(&ledger).ok();
            let replay = ledger.reconcile(&events, now);
            assert!(replay.is_ok());
            assert_eq!(serde_json::to_value(&ledger).ok(), settled);
        }
        Err(_) => assert_eq!(serde_json::to_value(&ledger).ok(), before),
    }
});
