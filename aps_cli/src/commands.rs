//! Subcommand bodies. Each reads its JSON inputs, calls into `aps_core`, and
//! prints one JSON document on stdout.

use std::path::Path;
use std::sync::Arc;

use aps_core::config::{Profile, ReconcileCfg};
use aps_core::history::{DoseTimeline, InsulinDose};
use aps_core::iob::ActivityCurve;
use aps_core::overrides::{ProfileOverride, TempTarget};
use aps_core::pump::bolus_delivery_time;
use aps_core::sensitivity::autosens::detect_sensitivity;
use aps_core::sensitivity::TddCalculator;
use aps_core::sensitivity::autotune::autotune;
use aps_core::types::CurrentTemp;
use aps_core::{
    ApsError, CarbEntry, CycleInputs, GlucoseSample, LedgerWorker, PendingLedger,
    PumpHistoryEvent, Resolution, TddRatioMiddleware, UnfinalizedDose, run_cycle,
};
use aps_traits::{Clock, ManualClock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use eyre::WrapErr;
use serde_json::json;

use crate::cli::{DataArgs, DoseArg, Outcome};
use crate::files::{read_json, read_list, write_json};

/// Lookback for commands that look at a day of insulin.
const DAY_HOURS: i64 = 24;

/// Everything the config file provides.
pub struct Loaded {
    pub profile: Profile,
    pub reconcile: ReconcileCfg,
}

/// Read, validate and convert the TOML config, optionally replacing the
/// basal schedule from CSV.
pub fn load_config(path: &Path, basal_csv: Option<&Path>) -> eyre::Result<Loaded> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ApsError::Config(format!("read {}: {e}", path.display())))?;
    let mut cfg = aps_config::load_toml(&text)
        .map_err(|e| ApsError::Config(format!("{}: {e}", path.display())))?;
    if let Some(csv) = basal_csv {
        cfg.basal.schedule = aps_config::load_basal_csv(csv)
            .map_err(|e| ApsError::Config(format!("{}: {e:#}", csv.display())))?;
    }
    cfg.validate().map_err(|e| ApsError::Config(format!("{e:#}")))?;
    let profile = Profile::try_from(&cfg)?;
    tracing::debug!(config = %path.display(), "configuration loaded");
    Ok(Loaded {
        profile,
        reconcile: ReconcileCfg::from(&cfg.reconcile),
    })
}

/// A missing ledger file is an empty ledger.
fn load_ledger(path: &Path, cfg: &ReconcileCfg) -> eyre::Result<PendingLedger> {
    if !path.exists() {
        tracing::info!(ledger = %path.display(), "ledger file not found, starting empty");
        return Ok(PendingLedger::new(cfg.clone()));
    }
    let raw: PendingLedger = read_json(path)?;
    Ok(PendingLedger::from_parts(raw.doses().to_vec(), raw.mappings().clone(), cfg.clone())?)
}

fn print(value: &serde_json::Value) -> eyre::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).wrap_err("serialize output")?
    );
    Ok(())
}

struct Data {
    glucose: Vec<GlucoseSample>,
    history: Vec<PumpHistoryEvent>,
    ledger: Vec<UnfinalizedDose>,
    carbs: Vec<CarbEntry>,
}

fn read_data(args: &DataArgs, cfg: &ReconcileCfg) -> eyre::Result<Data> {
    let ledger = match &args.ledger {
        Some(p) => load_ledger(p, cfg)?.doses().to_vec(),
        None => Vec::new(),
    };
    Ok(Data {
        glucose: read_list(args.glucose.as_deref())?,
        history: read_list(args.history.as_deref())?,
        ledger,
        carbs: read_list(args.carbs.as_deref())?,
    })
}

fn net_doses(
    profile: &Profile,
    timeline: &DoseTimeline,
    curve: &ActivityCurve,
    now: DateTime<Utc>,
) -> Vec<InsulinDose> {
    let dia = Duration::minutes(curve.end_minutes().ceil() as i64);
    timeline.net_insulin_doses(&profile.basal, now - dia - Duration::hours(DAY_HOURS), now)
}

fn parse_temp_target(s: &str) -> eyre::Result<TempTarget> {
    let bad = || ApsError::InvalidInput(format!("temp target `{s}` must look like 140-160"));
    let (lo, hi) = s.split_once('-').ok_or_else(bad)?;
    let low: f64 = lo.trim().parse().map_err(|_| bad())?;
    let high: f64 = hi.trim().parse().map_err(|_| bad())?;
    if !(low > 0.0 && low <= high) {
        return Err(bad().into());
    }
    Ok(TempTarget { low, high })
}

// ── suggest ──────────────────────────────────────────────────────────────────

pub struct SuggestArgs {
    pub data: DataArgs,
    pub temp_rate: Option<f64>,
    pub temp_minutes: Option<f64>,
    pub reservoir: Option<f64>,
    pub pump_updated_at: Option<DateTime<Utc>>,
    pub history_start: Option<DateTime<Utc>>,
    pub microbolus: bool,
    pub profile_override: Option<std::path::PathBuf>,
    pub temp_target: Option<String>,
    pub tdd_middleware: bool,
    pub out: Option<std::path::PathBuf>,
}

pub fn run_suggest(
    cfg: &Loaded,
    args: SuggestArgs,
    clock: Arc<dyn Clock + Send + Sync>,
) -> eyre::Result<()> {
    if args.data.glucose.is_none() {
        return Err(aps_core::BuildError::MissingGlucose.into());
    }
    let data = read_data(&args.data, &cfg.reconcile)?;

    let mut builder = CycleInputs::builder()
        .profile(cfg.profile.clone())
        .glucose(data.glucose)
        .clock(clock)
        .history(data.history)
        .ledger(data.ledger)
        .carbs(data.carbs)
        .microbolus_allowed(args.microbolus);
    if let Some(rate) = args.temp_rate {
        builder = builder.current_temp(CurrentTemp {
            rate,
            duration: args.temp_minutes.unwrap_or(0.0),
        });
    }
    if let Some(r) = args.reservoir {
        builder = builder.reservoir(r);
    }
    if let Some(at) = args.pump_updated_at {
        builder = builder.pump_updated_at(at);
    }
    if let Some(at) = args.history_start {
        builder = builder.history_start(at);
    }
    if let Some(p) = &args.profile_override {
        builder = builder.profile_override(read_json::<ProfileOverride>(p)?);
    }
    if let Some(tt) = &args.temp_target {
        builder = builder.temp_target(parse_temp_target(tt)?);
    }
    if args.tdd_middleware {
        builder = builder.middleware(Arc::new(TddRatioMiddleware::default()));
    }
    let inputs = builder.build()?;
    let out = run_cycle(&inputs)?;
    if let Some(path) = &args.out {
        write_json(path, &out.suggestion)?;
    }
    print(&serde_json::to_value(&out).wrap_err("serialize cycle output")?)
}

// ── ledger commands ──────────────────────────────────────────────────────────

pub struct RecordArgs {
    pub ledger: std::path::PathBuf,
    pub kind: DoseArg,
    pub units: Option<f64>,
    pub rate: Option<f64>,
    pub minutes: u32,
    pub at: Option<DateTime<Utc>>,
    pub manual: bool,
}

pub fn run_record(cfg: &Loaded, args: RecordArgs, now: DateTime<Utc>) -> eyre::Result<()> {
    let mut ledger = load_ledger(&args.ledger, &cfg.reconcile)?;
    let at = args.at.unwrap_or(now);
    let automatic = !args.manual;
    let dose = match args.kind {
        DoseArg::Bolus => {
            let units = args
                .units
                .ok_or_else(|| ApsError::InvalidInput("--units is required for a bolus".into()))?;
            let took = bolus_delivery_time(units, cfg.reconcile.variable_bolus_rate);
            UnfinalizedDose::bolus(units, at, took, automatic)
        }
        DoseArg::TempBasal => {
            let rate = args
                .rate
                .ok_or_else(|| ApsError::InvalidInput("--rate is required for a temp basal".into()))?;
            if !(rate.is_finite() && rate >= 0.0) {
                return Err(ApsError::InvalidInput(format!("rate {rate} must be >= 0")).into());
            }
            UnfinalizedDose::temp_basal(rate, at, Duration::minutes(i64::from(args.minutes)), automatic)
        }
        DoseArg::Suspend => UnfinalizedDose::suspend(at),
        DoseArg::Resume => UnfinalizedDose::resume(at),
    };
    let uuid = ledger.record(dose)?;
    write_json(&args.ledger, &ledger)?;
    print(&json!({ "uuid": uuid, "pending": ledger.doses().len() }))
}

/// Reconcile through the ledger worker so the commit and prune follow the
/// same single-writer path a long-running controller uses.
pub fn run_reconcile(
    cfg: &Loaded,
    ledger_path: &Path,
    history_path: &Path,
    drain: bool,
    now: DateTime<Utc>,
) -> eyre::Result<()> {
    let ledger = load_ledger(ledger_path, &cfg.reconcile)?;
    let events: Vec<PumpHistoryEvent> = read_json(history_path)?;
    let worker = LedgerWorker::spawn(ledger, ManualClock::new(now));
    let report = worker.reconcile(events)?;
    let finalized = if drain {
        worker.drain_finalized()?
    } else {
        Vec::new()
    };
    let snapshot = worker.snapshot()?;
    drop(worker);
    write_json(ledger_path, &snapshot)?;
    print(&json!({
        "matched": report.matched,
        "newly_uncertain": report.newly_uncertain,
        "uncertain": snapshot.uncertain_count(),
        "pending": snapshot.doses().len(),
        "remaining": report.remaining,
        "finalized": finalized,
    }))
}

pub fn run_resolve(
    cfg: &Loaded,
    ledger_path: &Path,
    uuid: uuid::Uuid,
    outcome: Outcome,
    units: Option<f64>,
) -> eyre::Result<()> {
    let mut ledger = load_ledger(ledger_path, &cfg.reconcile)?;
    let resolution = match outcome {
        Outcome::Delivered => Resolution::Delivered,
        Outcome::NotDelivered => Resolution::NotDelivered,
        Outcome::Partial => Resolution::Partial(units.ok_or_else(|| {
            ApsError::InvalidInput("--units is required for a partial outcome".into())
        })?),
    };
    ledger.resolve_uncertain(uuid, resolution)?;
    write_json(ledger_path, &ledger)?;
    print(&json!({ "uuid": uuid, "resolution": resolution }))
}

// ── sensitivity ──────────────────────────────────────────────────────────────

pub fn run_autosens(cfg: &Loaded, data: &DataArgs, now: DateTime<Utc>) -> eyre::Result<()> {
    let d = read_data(data, &cfg.reconcile)?;
    let profile = &cfg.profile;
    let timeline = DoseTimeline::build(&d.history, &d.ledger, now);
    let curve = ActivityCurve::new(&profile.insulin);
    let doses = net_doses(profile, &timeline, &curve, now);
    let result = detect_sensitivity(&d.glucose, &doses, &curve, &d.carbs, profile, now);
    print(&serde_json::to_value(&result).wrap_err("serialize autosens")?)
}

pub fn run_tdd(
    cfg: &Loaded,
    data: &DataArgs,
    history_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> eyre::Result<()> {
    let d = read_data(data, &cfg.reconcile)?;
    let timeline = DoseTimeline::build(&d.history, &d.ledger, now);
    let summary =
        TddCalculator::new(&cfg.profile).calculate(&timeline, &cfg.profile.basal, history_start, now);
    print(&serde_json::to_value(summary).wrap_err("serialize tdd")?)
}

pub fn run_autotune(cfg: &Loaded, data: &DataArgs, now: DateTime<Utc>) -> eyre::Result<()> {
    let d = read_data(data, &cfg.reconcile)?;
    let profile = &cfg.profile;
    let timeline = DoseTimeline::build(&d.history, &d.ledger, now);
    let curve = ActivityCurve::new(&profile.insulin);
    let earliest = d.glucose.iter().map(|g| g.date).min().unwrap_or(now);
    let dia = Duration::minutes(curve.end_minutes().ceil() as i64);
    let doses = timeline.net_insulin_doses(&profile.basal, earliest - dia, now);
    let result = autotune(profile, &d.glucose, &doses, &curve, &d.carbs, now)?;
    // The tuned profile must itself be valid before anyone adopts it.
    result.apply_to(profile)?;
    print(&serde_json::to_value(&result).wrap_err("serialize autotune")?)
}

pub fn run_self_check(cfg: &Loaded, clock: &dyn Clock) -> eyre::Result<()> {
    let p = &cfg.profile;
    let now = clock.now();
    print(&json!({
        "status": "ok",
        "sens": p.sens,
        "carb_ratio": p.carb_ratio,
        "current_basal": p.current_basal(now),
        "max_daily_basal": p.basal.max_daily_rate(),
        "basal_entries": p.basal.entries().len(),
        "targets": { "min_bg": p.targets.min_bg, "max_bg": p.targets.max_bg },
        "max_iob": p.max_iob,
        "dia_hours": p.insulin.dia_hours,
        "sensitivity_mode": format!("{:?}", p.sensitivity.mode),
        "match_window_secs": cfg.reconcile.match_window.num_seconds(),
    }))
}

/// Wall clock unless `--now` pins it.
pub fn clock_for(now: Option<DateTime<Utc>>) -> Arc<dyn Clock + Send + Sync> {
    match now {
        Some(t) => Arc::new(ManualClock::new(t)),
        None => Arc::new(SystemClock::new()),
    }
}
