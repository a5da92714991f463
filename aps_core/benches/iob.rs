use aps_core::config::{InsulinCfg, Profile, ReconcileCfg};
use aps_core::history::DoseTimeline;
use aps_core::iob::{ActivityCurve, iob_trajectory};
use aps_core::pump::bolus_delivery_time;
use aps_core::types::MappingTable;
use aps_core::{EventKind, EventRaw, PumpHistoryEvent, UnfinalizedDose, reconcile};
use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

// A day of looping: a temp every 5 minutes and a bolus every 3 hours.
fn synth_history(end: DateTime<Utc>) -> Vec<PumpHistoryEvent> {
    let mut state = 0x2545_f491_u32;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    let mut out = Vec::new();
    let start = end - Duration::hours(24);
    for i in 0..288u32 {
        let at = start + Duration::minutes(i64::from(i) * 5);
        let rate = f64::from(next() % 60) * 0.05;
        out.push(PumpHistoryEvent {
            raw: EventRaw(i.to_be_bytes().to_vec()),
            timestamp: at,
            kind: EventKind::TempBasal { rate },
        });
        out.push(PumpHistoryEvent {
            raw: EventRaw([0x16].iter().chain(&i.to_be_bytes()).copied().collect()),
            timestamp: at,
            kind: EventKind::TempBasalDuration { duration: 30 },
        });
        if i % 36 == 0 {
            let amount = f64::from(next() % 80 + 10) * 0.05;
            out.push(PumpHistoryEvent {
                raw: EventRaw([0x01].iter().chain(&i.to_be_bytes()).copied().collect()),
                timestamp: at + Duration::seconds(30),
                kind: EventKind::Bolus {
                    amount,
                    delivered: amount,
                    end: None,
                    automatic: false,
                },
            });
        }
    }
    out
}

pub fn bench_iob(c: &mut Criterion) {
    let mut g = c.benchmark_group("iob");
    // BENCH_SAMPLE_SIZE=10 cargo bench -p aps_core --bench iob
    let samples = std::env::var("BENCH_SAMPLE_SIZE")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(50);
    g.sample_size(samples.max(10));

    let now = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();
    let history = synth_history(now);
    let profile = Profile::default();
    let curve = ActivityCurve::new(&InsulinCfg::default());

    g.bench_function("timeline_24h", |b| {
        b.iter(|| DoseTimeline::build(black_box(&history), &[], now));
    });

    let timeline = DoseTimeline::build(&history, &[], now);
    let doses = timeline.net_insulin_doses(&profile.basal, now - Duration::hours(30), now);
    g.bench_function("trajectory_24h", |b| {
        b.iter(|| iob_trajectory(black_box(&doses), &curve, now));
    });

    let pending: Vec<UnfinalizedDose> = history
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Bolus { amount, .. } => Some(UnfinalizedDose::bolus(
                amount,
                e.timestamp - Duration::seconds(3),
                bolus_delivery_time(amount, false),
                false,
            )),
            _ => None,
        })
        .collect();
    let cfg = ReconcileCfg::default();
    g.bench_function("reconcile_24h", |b| {
        b.iter_batched(
            || pending.clone(),
            |p| reconcile(black_box(&history), &MappingTable::new(), &p, now, &cfg),
            BatchSize::SmallInput,
        );
    });
    g.finish();
}

criterion_group!(iob, bench_iob);
criterion_main!(iob);
