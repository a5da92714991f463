//! Dose timeline: pump history and the pending-dose ledger merged into
//! non-overlapping basal segments and discrete boluses.
//!
//! Rate changes are collected as timestamped markers, sorted once, and each
//! temp basal is closed by the earliest of: the next marker, its programmed
//! duration, or `now`. Lookups by time use binary search over the sorted
//! segment list.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::BasalSchedule;
use crate::status::DoseState;
use crate::types::{DoseKind, EventKind, PumpHistoryEvent, UnfinalizedDose};
use crate::util::minutes_between;

/// Assumed duration of a temp basal whose duration record never arrived.
pub const DEFAULT_TEMP_MINUTES: i64 = 30;
/// Chunk length used when converting basal segments into discrete doses.
const CHUNK_MINUTES: i64 = 5;
/// History entries this close to a ledger dose of the same shape are the same delivery.
const DUPLICATE_WINDOW_SECS: i64 = 60;
/// Pump duration records share their rate record's timestamp, give or take clock jitter.
const DURATION_PAIR_SECS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    TempBasal,
    Suspend,
}

/// Interval `[start, end)` during which the pump delivered `rate` U/h
/// instead of the scheduled basal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub rate: f64,
    pub kind: SegmentKind,
}

impl BasalSegment {
    pub fn minutes(&self) -> f64 {
        minutes_between(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusDose {
    pub at: DateTime<Utc>,
    pub units: f64,
    pub automatic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseSource {
    Bolus,
    Basal,
}

/// Insulin relative to the scheduled basal, delivered at an instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsulinDose {
    pub at: DateTime<Utc>,
    /// Net units; negative below the scheduled basal.
    pub units: f64,
    pub source: DoseSource,
}

/// A slice of time with a single delivery rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryPiece {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub rate: f64,
    /// True when no temp or suspend was active.
    pub scheduled: bool,
}

impl DeliveryPiece {
    pub fn units(&self) -> f64 {
        self.rate * minutes_between(self.start, self.end) / 60.0
    }
}

#[derive(Debug, Clone, Copy)]
enum Marker {
    Temp { rate: f64, programmed: Option<Duration> },
    Suspend,
    Resume,
}

#[derive(Debug, Clone, Copy)]
struct TimedMarker {
    at: DateTime<Utc>,
    marker: Marker,
}

fn near(a: DateTime<Utc>, b: DateTime<Utc>, secs: i64) -> bool {
    (a - b).num_seconds().abs() <= secs
}

#[derive(Debug, Clone, Default)]
pub struct DoseTimeline {
    segments: Vec<BasalSegment>,
    boluses: Vec<BolusDose>,
}

impl DoseTimeline {
    /// Merge confirmed history with the pending-dose ledger as of `now`.
    ///
    /// Uncertain ledger boluses count at their programmed amount.
    pub fn build(
        events: &[PumpHistoryEvent],
        ledger: &[UnfinalizedDose],
        now: DateTime<Utc>,
    ) -> Self {
        let durations: BTreeMap<DateTime<Utc>, u32> = events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::TempBasalDuration { duration } => Some((e.timestamp, duration)),
                _ => None,
            })
            .collect();

        let mut markers = Vec::new();
        let mut boluses = Vec::new();
        for d in ledger {
            match d.kind {
                DoseKind::Bolus => boluses.push(BolusDose {
                    at: d.start_time,
                    units: if d.state == DoseState::Uncertain {
                        d.programmed_units
                    } else {
                        d.delivered_units
                    },
                    automatic: d.automatic,
                }),
                DoseKind::TempBasal | DoseKind::Basal => {
                    if let Some(rate) = d.rate {
                        markers.push(TimedMarker {
                            at: d.start_time,
                            marker: Marker::Temp {
                                rate,
                                programmed: Some(d.duration),
                            },
                        });
                    }
                }
                DoseKind::Suspend => markers.push(TimedMarker {
                    at: d.start_time,
                    marker: Marker::Suspend,
                }),
                DoseKind::Resume => markers.push(TimedMarker {
                    at: d.start_time,
                    marker: Marker::Resume,
                }),
            }
        }
        let (ledger_boluses, ledger_markers) = (boluses.len(), markers.len());

        for ev in events {
            let at = ev.timestamp;
            match ev.kind {
                EventKind::Bolus {
                    amount,
                    delivered,
                    automatic,
                    ..
                } => {
                    let dup = boluses[..ledger_boluses].iter().any(|b| {
                        near(b.at, at, DUPLICATE_WINDOW_SECS)
                            && ((b.units - delivered).abs() < 1e-6
                                || (b.units - amount).abs() < 1e-6)
                    });
                    if !dup {
                        boluses.push(BolusDose {
                            at,
                            units: delivered,
                            automatic,
                        });
                    }
                }
                EventKind::TempBasal { rate } => {
                    let dup = markers[..ledger_markers].iter().any(|m| {
                        near(m.at, at, DUPLICATE_WINDOW_SECS)
                            && matches!(m.marker, Marker::Temp { rate: r, .. } if (r - rate).abs() < 1e-6)
                    });
                    if !dup {
                        let programmed = durations
                            .range(
                                at - Duration::seconds(DURATION_PAIR_SECS)
                                    ..=at + Duration::seconds(DURATION_PAIR_SECS),
                            )
                            .next()
                            .map(|(_, m)| Duration::minutes(i64::from(*m)));
                        markers.push(TimedMarker {
                            at,
                            marker: Marker::Temp { rate, programmed },
                        });
                    }
                }
                EventKind::Suspend | EventKind::Resume => {
                    let is_suspend = matches!(ev.kind, EventKind::Suspend);
                    let dup = markers[..ledger_markers].iter().any(|m| {
                        near(m.at, at, DUPLICATE_WINDOW_SECS)
                            && matches!(
                                (m.marker, is_suspend),
                                (Marker::Suspend, true) | (Marker::Resume, false)
                            )
                    });
                    if !dup {
                        markers.push(TimedMarker {
                            at,
                            marker: if is_suspend {
                                Marker::Suspend
                            } else {
                                Marker::Resume
                            },
                        });
                    }
                }
                EventKind::TempBasalDuration { .. } => {}
            }
        }

        markers.sort_by_key(|m| m.at);
        boluses.retain(|b| b.at <= now && b.units > 0.0);
        boluses.sort_by_key(|b| b.at);

        let mut segments = Vec::new();
        for (i, m) in markers.iter().enumerate() {
            if m.at >= now {
                break;
            }
            match m.marker {
                Marker::Temp { rate, programmed } => {
                    let programmed =
                        programmed.unwrap_or_else(|| Duration::minutes(DEFAULT_TEMP_MINUTES));
                    if programmed <= Duration::zero() {
                        // zero-duration temp cancels the running one
                        continue;
                    }
                    let mut end = (m.at + programmed).min(now);
                    if let Some(next) = markers.get(i + 1) {
                        end = end.min(next.at);
                    }
                    if end > m.at {
                        segments.push(BasalSegment {
                            start: m.at,
                            end,
                            rate,
                            kind: SegmentKind::TempBasal,
                        });
                    }
                }
                Marker::Suspend => {
                    let end = markers[i + 1..]
                        .iter()
                        .find(|n| matches!(n.marker, Marker::Resume))
                        .map_or(now, |n| n.at)
                        .min(now);
                    if end > m.at {
                        segments.push(BasalSegment {
                            start: m.at,
                            end,
                            rate: 0.0,
                            kind: SegmentKind::Suspend,
                        });
                    }
                }
                Marker::Resume => {}
            }
        }

        // Suspension wins over any temp programmed while suspended.
        let suspends: Vec<(DateTime<Utc>, DateTime<Utc>)> = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Suspend)
            .map(|s| (s.start, s.end))
            .collect();
        for seg in segments
            .iter_mut()
            .filter(|s| s.kind == SegmentKind::TempBasal)
        {
            for &(s, e) in &suspends {
                if seg.start >= s && seg.start < e {
                    seg.start = e;
                }
            }
        }
        segments.retain(|s| s.end > s.start);
        segments.sort_by_key(|s| s.start);

        tracing::trace!(
            segments = segments.len(),
            boluses = boluses.len(),
            "dose timeline built"
        );
        Self { segments, boluses }
    }

    pub fn basal_segments(&self) -> &[BasalSegment] {
        &self.segments
    }

    pub fn bolus_doses(&self) -> &[BolusDose] {
        &self.boluses
    }

    /// Segment covering `t`, if any (binary search by start).
    pub fn segment_at(&self, t: DateTime<Utc>) -> Option<&BasalSegment> {
        let idx = self.segments.partition_point(|s| s.start <= t);
        let seg = self.segments.get(idx.checked_sub(1)?)?;
        (t < seg.end).then_some(seg)
    }

    pub fn last_bolus_time(&self) -> Option<DateTime<Utc>> {
        self.boluses.last().map(|b| b.at)
    }

    /// Most recent temp basal segment.
    pub fn last_temp(&self) -> Option<&BasalSegment> {
        self.segments
            .iter()
            .rev()
            .find(|s| s.kind == SegmentKind::TempBasal)
    }

    /// Earliest instant with any recorded delivery.
    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        let seg = self.segments.first().map(|s| s.start);
        let bol = self.boluses.first().map(|b| b.at);
        match (seg, bol) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Actual delivery rate at `t`: a covering segment, else the schedule.
    pub fn delivered_rate_at(&self, t: DateTime<Utc>, basal: &BasalSchedule) -> f64 {
        self.segment_at(t)
            .map_or_else(|| basal.rate_at(t), |s| s.rate)
    }

    /// Cover `[from, to)` with pieces of constant delivery rate, split at
    /// segment edges and basal schedule changes.
    pub fn delivery_pieces(
        &self,
        basal: &BasalSchedule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<DeliveryPiece> {
        let mut out = Vec::new();
        let mut t = from;
        while t < to {
            let (end, rate, scheduled) = if let Some(seg) = self.segment_at(t) {
                (seg.end.min(to), seg.rate, false)
            } else {
                let next_seg = self.segments[self.segments.partition_point(|s| s.start <= t)..]
                    .first()
                    .map_or(to, |s| s.start);
                (
                    basal.next_change_after(t).min(next_seg).min(to),
                    basal.rate_at(t),
                    true,
                )
            };
            if end <= t {
                break;
            }
            out.push(DeliveryPiece {
                start: t,
                end,
                rate,
                scheduled,
            });
            t = end;
        }
        out
    }

    /// Net insulin doses in `[from, to]`: boluses as-is, temps and suspends
    /// as 5-minute chunks of (delivered − scheduled) insulin.
    pub fn net_insulin_doses(
        &self,
        basal: &BasalSchedule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<InsulinDose> {
        let mut out = Vec::new();
        for seg in &self.segments {
            let start = seg.start.max(from);
            let end = seg.end.min(to);
            let mut t = start;
            while t < end {
                let chunk_end = (t + Duration::minutes(CHUNK_MINUTES))
                    .min(end)
                    .min(basal.next_change_after(t));
                let hours = minutes_between(t, chunk_end) / 60.0;
                let net = (seg.rate - basal.rate_at(t)) * hours;
                if net != 0.0 {
                    out.push(InsulinDose {
                        at: t + (chunk_end - t) / 2,
                        units: net,
                        source: DoseSource::Basal,
                    });
                }
                t = chunk_end;
            }
        }
        out.extend(
            self.boluses
                .iter()
                .filter(|b| b.at >= from && b.at <= to)
                .map(|b| InsulinDose {
                    at: b.at,
                    units: b.units,
                    source: DoseSource::Bolus,
                }),
        );
        out.sort_by_key(|d| d.at);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventRaw;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap()
    }

    fn ev(min: i64, kind: EventKind) -> PumpHistoryEvent {
        PumpHistoryEvent {
            raw: EventRaw(vec![min as u8, 1]),
            timestamp: t0() + Duration::minutes(min),
            kind,
        }
    }

    #[test]
    fn temp_superseded_by_next_temp() {
        let events = vec![
            ev(0, EventKind::TempBasal { rate: 2.0 }),
            ev(0, EventKind::TempBasalDuration { duration: 30 }),
            ev(10, EventKind::TempBasal { rate: 0.5 }),
            ev(10, EventKind::TempBasalDuration { duration: 30 }),
        ];
        let tl = DoseTimeline::build(&events, &[], t0() + Duration::hours(2));
        let segs = tl.basal_segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].minutes(), 10.0);
        assert_eq!(segs[1].minutes(), 30.0);
        assert_eq!(tl.segment_at(t0() + Duration::minutes(12)).unwrap().rate, 0.5);
        assert!(tl.segment_at(t0() + Duration::minutes(45)).is_none());
    }

    #[test]
    fn unconfirmed_temp_uses_ledger_duration_or_default() {
        let events = vec![ev(0, EventKind::TempBasal { rate: 2.0 })];
        let tl = DoseTimeline::build(&events, &[], t0() + Duration::hours(2));
        assert_eq!(tl.basal_segments()[0].minutes(), DEFAULT_TEMP_MINUTES as f64);

        let pending =
            UnfinalizedDose::temp_basal(2.0, t0() + Duration::seconds(3), Duration::minutes(20), true);
        let tl = DoseTimeline::build(&events, &[pending], t0() + Duration::hours(2));
        assert_eq!(tl.basal_segments().len(), 1, "history entry defers to ledger dose");
        assert!((tl.basal_segments()[0].minutes() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn zero_duration_temp_cancels() {
        let events = vec![
            ev(0, EventKind::TempBasal { rate: 2.0 }),
            ev(0, EventKind::TempBasalDuration { duration: 60 }),
            ev(15, EventKind::TempBasal { rate: 0.0 }),
            ev(15, EventKind::TempBasalDuration { duration: 0 }),
        ];
        let tl = DoseTimeline::build(&events, &[], t0() + Duration::hours(2));
        assert_eq!(tl.basal_segments().len(), 1);
        assert_eq!(tl.basal_segments()[0].minutes(), 15.0);
    }

    #[test]
    fn suspend_overrides_and_ends_at_resume() {
        let events = vec![
            ev(0, EventKind::TempBasal { rate: 2.0 }),
            ev(0, EventKind::TempBasalDuration { duration: 60 }),
            ev(20, EventKind::Suspend),
            ev(25, EventKind::TempBasal { rate: 1.5 }),
            ev(25, EventKind::TempBasalDuration { duration: 30 }),
            ev(40, EventKind::Resume),
        ];
        let tl = DoseTimeline::build(&events, &[], t0() + Duration::hours(2));
        let kinds: Vec<_> = tl.basal_segments().iter().map(|s| (s.kind, s.minutes())).collect();
        assert_eq!(
            kinds,
            vec![
                (SegmentKind::TempBasal, 20.0),
                (SegmentKind::Suspend, 20.0),
            ]
        );
    }

    #[test]
    fn running_temp_is_cut_at_now() {
        let events = vec![
            ev(0, EventKind::TempBasal { rate: 2.0 }),
            ev(0, EventKind::TempBasalDuration { duration: 30 }),
        ];
        let tl = DoseTimeline::build(&events, &[], t0() + Duration::minutes(12));
        assert_eq!(tl.basal_segments()[0].minutes(), 12.0);
    }

    #[test]
    fn net_doses_chunk_and_subtract_schedule() {
        let events = vec![
            ev(0, EventKind::TempBasal { rate: 2.0 }),
            ev(0, EventKind::TempBasalDuration { duration: 30 }),
        ];
        let now = t0() + Duration::hours(1);
        let tl = DoseTimeline::build(&events, &[], now);
        let basal = BasalSchedule::flat(1.0);
        let doses = tl.net_insulin_doses(&basal, now - Duration::hours(6), now);
        assert_eq!(doses.len(), 6);
        let total: f64 = doses.iter().map(|d| d.units).sum();
        assert!((total - 0.5).abs() < 1e-9);
    }

    #[test]
    fn delivery_pieces_cover_interval() {
        let events = vec![
            ev(30, EventKind::TempBasal { rate: 3.0 }),
            ev(30, EventKind::TempBasalDuration { duration: 30 }),
        ];
        let now = t0() + Duration::hours(2);
        let tl = DoseTimeline::build(&events, &[], now);
        let basal = BasalSchedule::flat(1.0);
        let pieces = tl.delivery_pieces(&basal, t0(), now);
        let total: f64 = pieces.iter().map(DeliveryPiece::units).sum();
        // 1.5h scheduled at 1.0 + 0.5h at 3.0
        assert!((total - 3.0).abs() < 1e-9);
        assert!(pieces.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn uncertain_bolus_counts_programmed_amount() {
        let mut d = UnfinalizedDose::bolus(2.0, t0(), Duration::seconds(80), false);
        d.delivered_units = 0.5;
        d.state = DoseState::Uncertain;
        let tl = DoseTimeline::build(&[], &[d], t0() + Duration::minutes(30));
        assert_eq!(tl.bolus_doses()[0].units, 2.0);
    }
}
