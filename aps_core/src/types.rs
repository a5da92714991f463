//! Plain data exchanged between drivers, the core, and persistence.
//!
//! Everything here is serde-serializable so the caller can persist or ship
//! it unchanged; the core itself never touches files.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::status::DoseState;

// ── Glucose ──────────────────────────────────────────────────────────────────

/// CGM trend arrow, normalized across sensor vendors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Flat,
    #[serde(alias = "SingleUp", alias = "FortyFiveUp")]
    Up,
    #[serde(alias = "SingleDown", alias = "FortyFiveDown")]
    Down,
    #[serde(alias = "DoubleUp", alias = "TripleUp")]
    RisingFast,
    #[serde(alias = "DoubleDown", alias = "TripleDown")]
    FallingFast,
    #[default]
    #[serde(alias = "NONE", alias = "NOT COMPUTABLE", alias = "RATE OUT OF RANGE")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseSample {
    /// mg/dL
    #[serde(alias = "sgv")]
    pub glucose: i32,
    #[serde(alias = "dateString")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub direction: TrendDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend_rate: Option<f64>,
}

// ── Pump history ─────────────────────────────────────────────────────────────

/// Opaque device identifier of a pump history record.
///
/// Serialized as lowercase hex so it can key JSON maps.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventRaw(pub Vec<u8>);

impl EventRaw {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for EventRaw {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl fmt::Display for EventRaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for EventRaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventRaw({self})")
    }
}

impl Serialize for EventRaw {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for EventRaw {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Kind-specific payload of a pump history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum EventKind {
    Bolus {
        /// Programmed units.
        amount: f64,
        /// Units the pump reports as actually delivered.
        delivered: f64,
        /// End of delivery when the pump reports it (interrupted boluses).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<DateTime<Utc>>,
        #[serde(default)]
        automatic: bool,
    },
    TempBasal {
        /// U/h
        rate: f64,
    },
    TempBasalDuration {
        /// Minutes; 0 cancels the running temp.
        duration: u32,
    },
    #[serde(rename = "PumpSuspend")]
    Suspend,
    #[serde(rename = "PumpResume")]
    Resume,
}

impl EventKind {
    /// Dose kind this event can reconcile against, if any.
    pub fn dose_kind(&self) -> Option<DoseKind> {
        match self {
            Self::Bolus { .. } => Some(DoseKind::Bolus),
            Self::TempBasal { .. } => Some(DoseKind::TempBasal),
            Self::Suspend => Some(DoseKind::Suspend),
            Self::Resume => Some(DoseKind::Resume),
            Self::TempBasalDuration { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpHistoryEvent {
    pub raw: EventRaw,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

// ── Meals and temps ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarbEntry {
    #[serde(alias = "created_at")]
    pub at: DateTime<Utc>,
    pub carbs: f64,
    /// Explicit absorption time; falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absorption_hours: Option<f64>,
}

/// The temp basal the pump reports as currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentTemp {
    /// U/h
    pub rate: f64,
    /// Remaining minutes; 0 when no temp is running.
    pub duration: f64,
}

// ── Pending doses ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseKind {
    Bolus,
    TempBasal,
    Basal,
    Suspend,
    Resume,
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.num_milliseconds() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a finite, non-negative number of seconds"));
        }
        Ok(Duration::milliseconds((secs * 1000.0).round() as i64))
    }
}

/// A dose the controller commanded but the pump has not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfinalizedDose {
    pub uuid: Uuid,
    pub kind: DoseKind,
    pub programmed_units: f64,
    pub delivered_units: f64,
    /// U/h for temp basals and scheduled basal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    pub start_time: DateTime<Utc>,
    #[serde(rename = "duration_secs", with = "duration_secs")]
    pub duration: Duration,
    #[serde(rename = "is_reconciled_with_history")]
    pub reconciled: bool,
    pub state: DoseState,
    #[serde(default)]
    pub automatic: bool,
}

impl UnfinalizedDose {
    /// A commanded bolus. Delivery is assumed complete for IOB purposes
    /// until the pump says otherwise.
    pub fn bolus(units: f64, start_time: DateTime<Utc>, duration: Duration, automatic: bool) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kind: DoseKind::Bolus,
            programmed_units: units,
            delivered_units: units,
            rate: None,
            start_time,
            duration,
            reconciled: false,
            state: DoseState::Pending,
            automatic,
        }
    }

    /// A commanded temp basal; delivered units accrue as it runs.
    pub fn temp_basal(rate: f64, start_time: DateTime<Utc>, duration: Duration, automatic: bool) -> Self {
        let hours = duration.num_milliseconds() as f64 / 3_600_000.0;
        Self {
            uuid: Uuid::new_v4(),
            kind: DoseKind::TempBasal,
            programmed_units: rate * hours,
            delivered_units: 0.0,
            rate: Some(rate),
            start_time,
            duration,
            reconciled: false,
            state: DoseState::Pending,
            automatic,
        }
    }

    pub fn suspend(start_time: DateTime<Utc>) -> Self {
        Self::marker(DoseKind::Suspend, start_time)
    }

    pub fn resume(start_time: DateTime<Utc>) -> Self {
        Self::marker(DoseKind::Resume, start_time)
    }

    fn marker(kind: DoseKind, start_time: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kind,
            programmed_units: 0.0,
            delivered_units: 0.0,
            rate: None,
            start_time,
            duration: Duration::zero(),
            reconciled: false,
            state: DoseState::Pending,
            automatic: false,
        }
    }

    #[inline]
    pub fn finish_time(&self) -> DateTime<Utc> {
        self.start_time + self.duration
    }

    #[inline]
    pub fn is_finished(&self, now: DateTime<Utc>) -> bool {
        now >= self.finish_time()
    }

    /// An in-progress, unconfirmed bolus whose delivered amount may still change.
    pub fn is_mutable(&self, now: DateTime<Utc>) -> bool {
        self.kind == DoseKind::Bolus && !self.reconciled && !self.is_finished(now)
    }
}

/// Durable cross-reference from a consumed pump event to the dose it confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledDoseMapping {
    pub event_raw: EventRaw,
    pub dose_uuid: Uuid,
    pub start_time: DateTime<Utc>,
}

/// Mapping table keyed by event raw identifier.
pub type MappingTable = BTreeMap<EventRaw, ReconciledDoseMapping>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn event_json_uses_type_tag_and_hex_raw() {
        let ev = PumpHistoryEvent {
            raw: EventRaw(vec![0x01, 0xab]),
            timestamp: t0(),
            kind: EventKind::TempBasal { rate: 1.25 },
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["_type"], "TempBasal");
        assert_eq!(v["raw"], "01ab");
        assert_eq!(v["rate"], 1.25);
        let back: PumpHistoryEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn suspend_uses_pump_suspend_tag() {
        let json = r#"{"raw":"ff","timestamp":"2024-05-01T08:00:00Z","_type":"PumpSuspend"}"#;
        let ev: PumpHistoryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.kind, EventKind::Suspend);
    }

    #[test]
    fn mapping_table_keys_serialize_as_hex() {
        let mut m = MappingTable::new();
        let raw = EventRaw(vec![0xde, 0xad]);
        m.insert(
            raw.clone(),
            ReconciledDoseMapping {
                event_raw: raw,
                dose_uuid: Uuid::nil(),
                start_time: t0(),
            },
        );
        let s = serde_json::to_string(&m).unwrap();
        assert!(s.starts_with(r#"{"dead":"#));
        let back: MappingTable = serde_json::from_str(&s).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn trend_aliases_map_vendor_arrows() {
        let s: GlucoseSample = serde_json::from_str(
            r#"{"sgv":120,"dateString":"2024-05-01T08:00:00Z","direction":"DoubleUp"}"#,
        )
        .unwrap();
        assert_eq!(s.direction, TrendDirection::RisingFast);
        assert_eq!(s.glucose, 120);
    }

    #[test]
    fn bolus_mutability_follows_delivery_window() {
        let d = UnfinalizedDose::bolus(2.0, t0(), Duration::seconds(80), false);
        assert!(d.is_mutable(t0() + Duration::seconds(10)));
        assert!(!d.is_mutable(t0() + Duration::seconds(80)));
        assert!(d.is_finished(t0() + Duration::seconds(80)));
    }

    #[test]
    fn temp_basal_programmed_units_from_rate() {
        let d = UnfinalizedDose::temp_basal(1.2, t0(), Duration::minutes(30), true);
        assert!((d.programmed_units - 0.6).abs() < 1e-12);
        assert_eq!(d.delivered_units, 0.0);
    }
}
