//! Pending-dose reconciliation.
//!
//! Commanded doses are kept in a ledger until the pump's own history confirms
//! them. [`reconcile`] is a pure function over the ledger, the mapping table,
//! and a batch of history events: it never mutates its inputs, so a caller
//! either commits the whole outcome or keeps the old state.
//!
//! Matching is event-driven. For every unmapped event, the eligible doses are
//! those of the same kind and programmed amount/rate, still matchable, and
//! started within the match window. The earliest-starting dose wins, ties go
//! to the lowest uuid.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ReconcileCfg;
use crate::error::ApsError;
use crate::fixed_point::units_to_milli;
use crate::pump::estimate_temp_basal_progress;
use crate::status::DoseState;
use crate::types::{
    DoseKind, EventKind, EventRaw, MappingTable, PumpHistoryEvent, ReconciledDoseMapping,
    UnfinalizedDose,
};

/// A TempBasalDuration record belongs to the TempBasal within this many seconds.
const DURATION_SIBLING_SECS: i64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub pending: Vec<UnfinalizedDose>,
    pub mappings: MappingTable,
    /// Events that confirmed no pending dose and were not mapped before.
    pub remaining: Vec<PumpHistoryEvent>,
    pub matched: usize,
    pub newly_uncertain: usize,
}

fn same_amount(a: f64, b: f64) -> bool {
    units_to_milli(a) == units_to_milli(b)
}

fn check_inputs(events: &[PumpHistoryEvent], pending: &[UnfinalizedDose]) -> Result<(), ApsError> {
    let mut seen = BTreeSet::new();
    for d in pending {
        if !seen.insert(d.uuid) {
            return Err(ApsError::Ledger(format!("dose {} appears twice", d.uuid)));
        }
        if !(d.programmed_units.is_finite() && d.delivered_units.is_finite()) {
            return Err(ApsError::Ledger(format!("dose {} has a non-finite amount", d.uuid)));
        }
    }
    for ev in events {
        let ok = match ev.kind {
            EventKind::Bolus {
                amount, delivered, ..
            } => amount.is_finite() && delivered.is_finite() && amount >= 0.0 && delivered >= 0.0,
            EventKind::TempBasal { rate } => rate.is_finite() && rate >= 0.0,
            _ => true,
        };
        if !ok {
            return Err(ApsError::InvalidInput(format!(
                "history event {} has an invalid amount",
                ev.raw
            )));
        }
    }
    Ok(())
}

fn event_matches(ev: &PumpHistoryEvent, dose: &UnfinalizedDose, window: Duration) -> bool {
    if !dose.state.is_matchable() || dose.reconciled {
        return false;
    }
    if (ev.timestamp - dose.start_time).num_milliseconds().abs() >= window.num_milliseconds() {
        return false;
    }
    match (&ev.kind, dose.kind) {
        (EventKind::Bolus { amount, .. }, DoseKind::Bolus) => {
            same_amount(*amount, dose.programmed_units)
        }
        (EventKind::TempBasal { rate }, DoseKind::TempBasal) => {
            dose.rate.is_some_and(|r| same_amount(*rate, r))
        }
        (EventKind::Suspend, DoseKind::Suspend) | (EventKind::Resume, DoseKind::Resume) => true,
        _ => false,
    }
}

/// Copy the confirmed delivery of `ev` onto `dose`.
fn apply_event(dose: &mut UnfinalizedDose, ev: &PumpHistoryEvent, batch: &[PumpHistoryEvent]) {
    dose.reconciled = true;
    dose.state = DoseState::Reconciled;
    match ev.kind {
        EventKind::Bolus { delivered, end, .. } => {
            if delivered > dose.programmed_units {
                tracing::warn!(
                    uuid = %dose.uuid,
                    delivered,
                    programmed = dose.programmed_units,
                    "pump reports more than programmed, capping"
                );
            }
            dose.delivered_units = delivered.min(dose.programmed_units);
            if let Some(end) = end {
                let took = end - ev.timestamp;
                if took > Duration::zero() && took < dose.duration {
                    dose.duration = took;
                }
            }
        }
        EventKind::TempBasal { rate } => {
            let sibling = batch.iter().find_map(|other| match other.kind {
                EventKind::TempBasalDuration { duration }
                    if (other.timestamp - ev.timestamp).num_seconds().abs()
                        <= DURATION_SIBLING_SECS =>
                {
                    Some(duration)
                }
                _ => None,
            });
            if let Some(minutes) = sibling {
                dose.duration = Duration::minutes(i64::from(minutes));
                dose.programmed_units = rate * f64::from(minutes) / 60.0;
            }
        }
        _ => {}
    }
}

/// Cut a temp basal short at the first later rate change or suspend that
/// starts while it runs.
fn truncate_temp(
    dose: &mut UnfinalizedDose,
    events: &[PumpHistoryEvent],
    mappings: &MappingTable,
    cfg: &ReconcileCfg,
) {
    let Some(rate) = dose.rate.filter(|_| dose.kind == DoseKind::TempBasal) else {
        return;
    };
    let finish = dose.finish_time();
    let cut = events
        .iter()
        .filter(|ev| matches!(ev.kind, EventKind::TempBasal { .. } | EventKind::Suspend))
        .filter(|ev| ev.timestamp > dose.start_time && ev.timestamp < finish)
        .filter(|ev| ev.timestamp - dose.start_time >= cfg.match_window)
        .filter(|ev| mappings.get(&ev.raw).is_none_or(|m| m.dose_uuid != dose.uuid))
        .map(|ev| ev.timestamp)
        .min();
    if let Some(at) = cut {
        let elapsed = at - dose.start_time;
        let progress = estimate_temp_basal_progress(rate, dose.duration, elapsed, cfg.pulses_per_unit);
        tracing::debug!(uuid = %dose.uuid, %at, delivered = progress.delivered, "temp basal truncated");
        dose.duration = elapsed;
        dose.delivered_units = progress.delivered;
    }
}

/// Match `events` against `pending` as of `now`.
///
/// Already-mapped events are dropped from the remaining set without touching
/// any dose, which makes a replay of the same batch a no-op.
pub fn reconcile(
    events: &[PumpHistoryEvent],
    mappings: &MappingTable,
    pending: &[UnfinalizedDose],
    now: DateTime<Utc>,
    cfg: &ReconcileCfg,
) -> Result<ReconcileOutcome, ApsError> {
    check_inputs(events, pending)?;

    let mut doses = pending.to_vec();
    let mut table = mappings.clone();
    let mut consumed: BTreeSet<EventRaw> = BTreeSet::new();
    let mut matched = 0;

    let mut order: Vec<&PumpHistoryEvent> =
        events.iter().filter(|e| !mappings.contains_key(&e.raw)).collect();
    order.sort_by_key(|e| e.timestamp);

    for ev in order {
        if ev.kind.dose_kind().is_none() || consumed.contains(&ev.raw) {
            continue;
        }
        let winner = doses
            .iter()
            .enumerate()
            .filter(|(_, d)| event_matches(ev, d, cfg.match_window))
            .min_by_key(|(_, d)| (d.start_time, d.uuid))
            .map(|(i, _)| i);
        let Some(i) = winner else { continue };
        let dose = &mut doses[i];
        apply_event(dose, ev, events);
        table.insert(
            ev.raw.clone(),
            ReconciledDoseMapping {
                event_raw: ev.raw.clone(),
                dose_uuid: dose.uuid,
                start_time: dose.start_time,
            },
        );
        consumed.insert(ev.raw.clone());
        matched += 1;
        tracing::debug!(uuid = %dose.uuid, raw = %ev.raw, kind = ?dose.kind, "dose reconciled");
    }

    let mut newly_uncertain = 0;
    for dose in &mut doses {
        truncate_temp(dose, events, &table, cfg);
        if dose.kind == DoseKind::TempBasal {
            if let Some(rate) = dose.rate.filter(|_| dose.delivered_units < dose.programmed_units) {
                let elapsed = now.min(dose.finish_time()) - dose.start_time;
                let accrued =
                    estimate_temp_basal_progress(rate, dose.duration, elapsed, cfg.pulses_per_unit);
                dose.delivered_units = dose
                    .delivered_units
                    .max(accrued.delivered)
                    .min(dose.programmed_units);
            }
        }
        if dose.state == DoseState::Pending
            && !dose.reconciled
            && dose.finish_time() + cfg.uncertainty_window < now
        {
            dose.state = DoseState::Uncertain;
            newly_uncertain += 1;
            tracing::warn!(
                uuid = %dose.uuid,
                kind = ?dose.kind,
                programmed = dose.programmed_units,
                "no pump record confirms dose, marking uncertain"
            );
        }
    }

    let remaining = events
        .iter()
        .filter(|e| !table.contains_key(&e.raw))
        .cloned()
        .collect();

    Ok(ReconcileOutcome {
        pending: doses,
        mappings: table,
        remaining,
        matched,
        newly_uncertain,
    })
}

/// Recovery decision for an uncertain dose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "units")]
pub enum Resolution {
    Delivered,
    NotDelivered,
    Partial(f64),
}

/// Result of [`PendingLedger::reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub remaining: Vec<PumpHistoryEvent>,
    pub matched: usize,
    pub newly_uncertain: usize,
}

/// Single-writer ledger of commanded doses and the events that confirmed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingLedger {
    #[serde(default)]
    doses: Vec<UnfinalizedDose>,
    #[serde(default)]
    mappings: MappingTable,
    #[serde(skip)]
    cfg: ReconcileCfg,
}

impl PendingLedger {
    pub fn new(cfg: ReconcileCfg) -> Self {
        Self {
            doses: Vec::new(),
            mappings: MappingTable::new(),
            cfg,
        }
    }

    pub fn from_parts(
        doses: Vec<UnfinalizedDose>,
        mappings: MappingTable,
        cfg: ReconcileCfg,
    ) -> Result<Self, ApsError> {
        check_inputs(&[], &doses)?;
        Ok(Self {
            doses,
            mappings,
            cfg,
        })
    }

    #[must_use]
    pub fn with_config(mut self, cfg: ReconcileCfg) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn doses(&self) -> &[UnfinalizedDose] {
        &self.doses
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    pub fn config(&self) -> &ReconcileCfg {
        &self.cfg
    }

    pub fn uncertain_count(&self) -> usize {
        self.doses
            .iter()
            .filter(|d| d.state == DoseState::Uncertain)
            .count()
    }

    /// Add a freshly commanded dose.
    pub fn record(&mut self, dose: UnfinalizedDose) -> Result<Uuid, ApsError> {
        if self.doses.iter().any(|d| d.uuid == dose.uuid) {
            return Err(ApsError::Ledger(format!("dose {} already recorded", dose.uuid)));
        }
        if !(dose.programmed_units.is_finite() && dose.programmed_units >= 0.0) {
            return Err(ApsError::InvalidInput(format!(
                "programmed units {} must be finite and >= 0",
                dose.programmed_units
            )));
        }
        tracing::info!(uuid = %dose.uuid, kind = ?dose.kind, units = dose.programmed_units, "dose recorded");
        let uuid = dose.uuid;
        self.doses.push(dose);
        Ok(uuid)
    }

    /// Reconcile a history batch and commit the outcome; on error nothing changes.
    pub fn reconcile(
        &mut self,
        events: &[PumpHistoryEvent],
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ApsError> {
        let out = reconcile(events, &self.mappings, &self.doses, now, &self.cfg)?;
        self.doses = out.pending;
        self.mappings = out.mappings;
        Ok(ReconcileReport {
            remaining: out.remaining,
            matched: out.matched,
            newly_uncertain: out.newly_uncertain,
        })
    }

    /// Settle an uncertain dose by an explicit decision.
    pub fn resolve_uncertain(&mut self, uuid: Uuid, resolution: Resolution) -> Result<(), ApsError> {
        let dose = self
            .doses
            .iter_mut()
            .find(|d| d.uuid == uuid)
            .ok_or(ApsError::UnknownDose(uuid))?;
        if dose.state != DoseState::Uncertain {
            return Err(ApsError::Ledger(format!(
                "dose {uuid} is {:?}, only uncertain doses can be resolved",
                dose.state
            )));
        }
        let delivered = match resolution {
            Resolution::Delivered => dose.programmed_units,
            Resolution::NotDelivered => 0.0,
            Resolution::Partial(u) => {
                if !(u.is_finite() && u >= 0.0 && u <= dose.programmed_units) {
                    return Err(ApsError::InvalidInput(format!(
                        "partial delivery {u} must be within 0..={}",
                        dose.programmed_units
                    )));
                }
                u
            }
        };
        if dose.kind == DoseKind::TempBasal {
            if let Some(rate) = dose.rate.filter(|r| *r > 0.0) {
                dose.duration = Duration::milliseconds((delivered / rate * 3_600_000.0).round() as i64);
            }
            if delivered <= 0.0 {
                // nothing ran
                dose.rate = None;
            }
        }
        dose.delivered_units = delivered;
        dose.reconciled = true;
        dose.state = DoseState::Reconciled;
        tracing::info!(%uuid, ?resolution, delivered, "uncertain dose resolved");
        Ok(())
    }

    /// Remove reconciled, finished doses; the caller flushes them to history.
    pub fn drain_finalized(&mut self, now: DateTime<Utc>) -> Vec<UnfinalizedDose> {
        let (done, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.doses)
            .into_iter()
            .partition(|d| d.reconciled && d.is_finished(now));
        self.doses = keep;
        done
    }

    /// Forget mappings older than the retention window. Returns how many went.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.cfg.mapping_retention;
        let before = self.mappings.len();
        self.mappings.retain(|_, m| m.start_time >= cutoff);
        before - self.mappings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn bolus_event(raw: &[u8], at: DateTime<Utc>, amount: f64, delivered: f64) -> PumpHistoryEvent {
        PumpHistoryEvent {
            raw: EventRaw(raw.to_vec()),
            timestamp: at,
            kind: EventKind::Bolus {
                amount,
                delivered,
                end: None,
                automatic: false,
            },
        }
    }

    #[test]
    fn unmatched_dose_goes_uncertain_after_window() {
        let cfg = ReconcileCfg::default();
        let d = UnfinalizedDose::bolus(1.0, t0(), Duration::seconds(40), true);
        let early = reconcile(&[], &MappingTable::new(), &[d.clone()], t0() + Duration::minutes(5), &cfg).unwrap();
        assert_eq!(early.pending[0].state, DoseState::Pending);
        let late = reconcile(&[], &MappingTable::new(), &[d], t0() + Duration::minutes(11), &cfg).unwrap();
        assert_eq!(late.pending[0].state, DoseState::Uncertain);
        assert_eq!(late.newly_uncertain, 1);
    }

    #[test]
    fn uncertain_dose_recovers_on_late_event() {
        let cfg = ReconcileCfg::default();
        let mut d = UnfinalizedDose::bolus(1.0, t0(), Duration::seconds(40), true);
        d.state = DoseState::Uncertain;
        let ev = bolus_event(&[1], t0() + Duration::seconds(5), 1.0, 0.6);
        let out = reconcile(&[ev], &MappingTable::new(), &[d], t0() + Duration::minutes(30), &cfg).unwrap();
        assert_eq!(out.pending[0].state, DoseState::Reconciled);
        assert_eq!(out.pending[0].delivered_units, 0.6);
    }

    #[test]
    fn different_amount_does_not_match() {
        let cfg = ReconcileCfg::default();
        let d = UnfinalizedDose::bolus(1.0, t0(), Duration::seconds(40), false);
        let ev = bolus_event(&[1], t0(), 1.05, 1.05);
        let out = reconcile(&[ev], &MappingTable::new(), &[d], t0(), &cfg).unwrap();
        assert_eq!(out.matched, 0);
        assert_eq!(out.remaining.len(), 1);
    }

    #[test]
    fn temp_basal_picks_up_duration_sibling_and_truncation() {
        let cfg = ReconcileCfg::default();
        let d = UnfinalizedDose::temp_basal(1.0, t0(), Duration::minutes(30), true);
        let events = vec![
            PumpHistoryEvent {
                raw: EventRaw(vec![1]),
                timestamp: t0() + Duration::seconds(3),
                kind: EventKind::TempBasal { rate: 1.0 },
            },
            PumpHistoryEvent {
                raw: EventRaw(vec![2]),
                timestamp: t0() + Duration::seconds(3),
                kind: EventKind::TempBasalDuration { duration: 60 },
            },
            PumpHistoryEvent {
                raw: EventRaw(vec![3]),
                timestamp: t0() + Duration::minutes(11),
                kind: EventKind::TempBasal { rate: 0.0 },
            },
        ];
        let out = reconcile(&events, &MappingTable::new(), &[d], t0() + Duration::minutes(20), &cfg).unwrap();
        let dose = &out.pending[0];
        assert!(dose.reconciled);
        assert_eq!(dose.duration, Duration::minutes(11));
        assert_eq!(dose.delivered_units, 0.175);
        assert!((dose.programmed_units - 1.0).abs() < 1e-9);
        // the cancel and the duration record pass through
        assert_eq!(out.remaining.len(), 2);
    }

    #[test]
    fn duplicate_dose_ids_reject_the_batch() {
        let d = UnfinalizedDose::bolus(1.0, t0(), Duration::seconds(40), false);
        let err = reconcile(&[], &MappingTable::new(), &[d.clone(), d], t0(), &ReconcileCfg::default());
        assert!(matches!(err, Err(ApsError::Ledger(_))));
    }

    #[test]
    fn ledger_resolve_and_drain() {
        let mut ledger = PendingLedger::new(ReconcileCfg::default());
        let id = ledger
            .record(UnfinalizedDose::bolus(2.0, t0(), Duration::seconds(80), false))
            .unwrap();
        assert!(matches!(
            ledger.resolve_uncertain(id, Resolution::Delivered),
            Err(ApsError::Ledger(_))
        ));
        ledger.reconcile(&[], t0() + Duration::minutes(15)).unwrap();
        assert_eq!(ledger.uncertain_count(), 1);
        assert!(matches!(
            ledger.resolve_uncertain(id, Resolution::Partial(2.5)),
            Err(ApsError::InvalidInput(_))
        ));
        ledger.resolve_uncertain(id, Resolution::Partial(0.5)).unwrap();
        assert_eq!(ledger.uncertain_count(), 0);
        let drained = ledger.drain_finalized(t0() + Duration::minutes(15));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].delivered_units, 0.5);
        assert!(ledger.doses().is_empty());
        assert!(matches!(
            ledger.resolve_uncertain(Uuid::nil(), Resolution::Delivered),
            Err(ApsError::UnknownDose(_))
        ));
    }

    #[test]
    fn prune_drops_old_mappings() {
        let mut ledger = PendingLedger::new(ReconcileCfg::default());
        ledger
            .record(UnfinalizedDose::bolus(1.0, t0(), Duration::seconds(40), false))
            .unwrap();
        ledger
            .reconcile(&[bolus_event(&[9], t0(), 1.0, 1.0)], t0() + Duration::minutes(1))
            .unwrap();
        assert_eq!(ledger.mappings().len(), 1);
        assert_eq!(ledger.prune(t0() + Duration::hours(11)), 0);
        assert_eq!(ledger.prune(t0() + Duration::hours(13)), 1);
    }
}
