//! Configuration types for the decision core.
//!
//! These are the runtime configuration structs consumed by the pipeline.
//! They are separate from the TOML-deserialized config in `aps_config`.

use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};

use crate::error::ApsError;

/// Insulin activity curve family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurveKind {
    /// Legacy piecewise curve scaled from a 3h action profile.
    Bilinear,
    #[default]
    RapidActing,
    UltraRapid,
}

/// Insulin pharmacodynamics.
#[derive(Debug, Clone)]
pub struct InsulinCfg {
    pub curve: CurveKind,
    /// Duration of insulin action in hours.
    pub dia_hours: f64,
    /// Custom peak in minutes; `None` uses the curve default.
    pub custom_peak_minutes: Option<u32>,
}

impl Default for InsulinCfg {
    fn default() -> Self {
        Self {
            curve: CurveKind::RapidActing,
            dia_hours: 6.0,
            custom_peak_minutes: None,
        }
    }
}

impl InsulinCfg {
    /// Peak used by the activity curve, clamped to the curve's valid range.
    pub fn peak_minutes(&self) -> f64 {
        match (self.curve, self.custom_peak_minutes) {
            (CurveKind::Bilinear, _) => 75.0,
            (CurveKind::RapidActing, Some(p)) => f64::from(p.clamp(50, 120)),
            (CurveKind::UltraRapid, Some(p)) => f64::from(p.clamp(35, 100)),
            (CurveKind::RapidActing, None) => 75.0,
            (CurveKind::UltraRapid, None) => 55.0,
        }
    }

    /// Peak used for the dynamic-ISF insulin factor (`120 - peak`).
    pub fn dynamic_isf_peak(&self) -> f64 {
        match (self.curve, self.custom_peak_minutes) {
            (CurveKind::RapidActing | CurveKind::UltraRapid, Some(_)) => self.peak_minutes(),
            (CurveKind::UltraRapid, None) => 50.0,
            _ => 65.0,
        }
    }

    pub fn dia_minutes(&self) -> f64 {
        self.dia_hours * 60.0
    }
}

/// One basal schedule entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalEntry {
    /// Minutes after local midnight.
    pub minutes: u32,
    /// U/h
    pub rate: f64,
}

/// Time-of-day basal schedule evaluated in a fixed local offset.
#[derive(Debug, Clone)]
pub struct BasalSchedule {
    entries: Vec<BasalEntry>,
    offset: FixedOffset,
}

impl BasalSchedule {
    /// Build from entries; they are sorted by start and the first is forced to 00:00.
    pub fn new(mut entries: Vec<BasalEntry>, utc_offset_minutes: i32) -> Result<Self, ApsError> {
        if entries.is_empty() {
            return Err(ApsError::Config("basal schedule is empty".into()));
        }
        entries.sort_by_key(|e| e.minutes);
        if entries.windows(2).any(|w| w[0].minutes == w[1].minutes) {
            return Err(ApsError::Config("basal schedule has duplicate start times".into()));
        }
        if entries.iter().any(|e| !(e.rate.is_finite() && e.rate >= 0.0) || e.minutes >= 1440) {
            return Err(ApsError::Config("basal schedule has an invalid entry".into()));
        }
        entries[0].minutes = 0;
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or_else(|| ApsError::Config("basal schedule utc offset out of range".into()))?;
        Ok(Self { entries, offset })
    }

    /// A single rate all day.
    pub fn flat(rate: f64) -> Self {
        Self {
            entries: vec![BasalEntry { minutes: 0, rate }],
            offset: Utc.fix(),
        }
    }

    pub fn entries(&self) -> &[BasalEntry] {
        &self.entries
    }

    pub fn utc_offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    fn local_minutes(&self, t: DateTime<Utc>) -> u32 {
        let local = t.with_timezone(&self.offset);
        local.hour() * 60 + local.minute()
    }

    /// Index of the entry active at local minute `m` (binary search).
    fn index_at(&self, m: u32) -> usize {
        self.entries
            .partition_point(|e| e.minutes <= m)
            .saturating_sub(1)
    }

    /// Scheduled rate at `t`.
    pub fn rate_at(&self, t: DateTime<Utc>) -> f64 {
        self.entries[self.index_at(self.local_minutes(t))].rate
    }

    /// First schedule boundary strictly after `t` (at most 24h later).
    pub fn next_change_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let m = self.local_minutes(t);
        let idx = self.index_at(m);
        let next_minutes = self
            .entries
            .get(idx + 1)
            .map_or(1440, |e| e.minutes);
        let local = t.with_timezone(&self.offset);
        let into_minute = Duration::seconds(i64::from(local.second()))
            + Duration::nanoseconds(i64::from(local.nanosecond()));
        t - into_minute + Duration::minutes(i64::from(next_minutes - m))
    }

    /// Largest scheduled rate of the day.
    pub fn max_daily_rate(&self) -> f64 {
        self.entries.iter().map(|e| e.rate).fold(0.0, f64::max)
    }

    /// Replace the rate of every entry via `f`.
    pub fn map_rates(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|e| BasalEntry {
                    minutes: e.minutes,
                    rate: f(e.rate),
                })
                .collect(),
            offset: self.offset,
        }
    }
}

/// Target glucose range, mg/dL.
#[derive(Debug, Clone, Copy)]
pub struct Targets {
    pub min_bg: f64,
    pub max_bg: f64,
}

impl Targets {
    pub fn target_bg(&self) -> f64 {
        (self.min_bg + self.max_bg) / 2.0
    }
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            min_bg: 100.0,
            max_bg: 100.0,
        }
    }
}

/// Which sensitivity estimator feeds the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensitivityMode {
    Off,
    #[default]
    Autosens,
    DynamicIsf,
    /// The profile already carries autotune output; ratio stays 1.
    Autotuned,
}

/// Sensitivity bounds and target/exercise behavior.
#[derive(Debug, Clone)]
pub struct SensitivityCfg {
    pub mode: SensitivityMode,
    pub autosens_min: f64,
    pub autosens_max: f64,
    pub resistance_lowers_target: bool,
    pub sensitivity_raises_target: bool,
    pub exercise_mode: bool,
    pub high_temptarget_raises_sensitivity: bool,
    pub low_temptarget_lowers_sensitivity: bool,
    /// Temp target at which basal is halved in exercise mode.
    pub half_basal_exercise_target: f64,
}

impl Default for SensitivityCfg {
    fn default() -> Self {
        Self {
            mode: SensitivityMode::Autosens,
            autosens_min: 0.7,
            autosens_max: 1.2,
            resistance_lowers_target: false,
            sensitivity_raises_target: true,
            exercise_mode: false,
            high_temptarget_raises_sensitivity: false,
            low_temptarget_lowers_sensitivity: false,
            half_basal_exercise_target: 160.0,
        }
    }
}

/// Dynamic-ISF tuning.
#[derive(Debug, Clone)]
pub struct DynamicIsfCfg {
    /// Use the sigmoid form instead of the logarithmic one.
    pub sigmoid: bool,
    pub adjustment_factor: f64,
    pub adjustment_factor_sigmoid: f64,
    /// Share of the 2h-extrapolated TDD in the weighted average.
    pub weight_percentage: f64,
    pub enable_dynamic_cr: bool,
}

impl Default for DynamicIsfCfg {
    fn default() -> Self {
        Self {
            sigmoid: false,
            adjustment_factor: 0.8,
            adjustment_factor_sigmoid: 0.5,
            weight_percentage: 0.65,
            enable_dynamic_cr: false,
        }
    }
}

/// Micro-bolus settings.
#[derive(Debug, Clone)]
pub struct SmbCfg {
    pub enable_always: bool,
    pub enable_with_cob: bool,
    pub allow_with_high_temptarget: bool,
    pub max_smb_basal_minutes: u32,
    pub max_uam_smb_basal_minutes: u32,
    pub smb_interval_min: u32,
    pub smb_delivery_ratio: f64,
    pub bolus_increment: f64,
}

impl Default for SmbCfg {
    fn default() -> Self {
        Self {
            enable_always: false,
            enable_with_cob: false,
            allow_with_high_temptarget: false,
            max_smb_basal_minutes: 30,
            max_uam_smb_basal_minutes: 30,
            smb_interval_min: 3,
            smb_delivery_ratio: 0.5,
            bolus_increment: 0.1,
        }
    }
}

/// Carb absorption settings.
#[derive(Debug, Clone)]
pub struct CarbsCfg {
    /// mg/dL per 5 minutes.
    pub min_5m_carbimpact: f64,
    pub max_cob: f64,
    pub default_absorption_hours: f64,
    pub max_absorption_factor: f64,
}

impl Default for CarbsCfg {
    fn default() -> Self {
        Self {
            min_5m_carbimpact: 8.0,
            max_cob: 120.0,
            default_absorption_hours: 3.0,
            max_absorption_factor: 2.0,
        }
    }
}

/// Fail-safe bounds for input freshness and reservoir.
#[derive(Debug, Clone)]
pub struct SafetyCfg {
    pub max_glucose_age_min: f64,
    pub max_pump_age_min: f64,
    pub min_reservoir_units: f64,
    /// Fixed low-glucose suspend threshold; derived from targets when `None`.
    pub low_glucose_suspend: Option<f64>,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            max_glucose_age_min: 12.0,
            max_pump_age_min: 15.0,
            min_reservoir_units: 0.5,
            low_glucose_suspend: None,
        }
    }
}

/// Pending-dose reconciliation tuning.
#[derive(Debug, Clone)]
pub struct ReconcileCfg {
    pub match_window: Duration,
    pub uncertainty_window: Duration,
    pub mapping_retention: Duration,
    pub pulses_per_unit: u32,
    pub variable_bolus_rate: bool,
}

impl Default for ReconcileCfg {
    fn default() -> Self {
        Self {
            match_window: Duration::seconds(60),
            uncertainty_window: Duration::minutes(10),
            mapping_retention: Duration::hours(12),
            pulses_per_unit: 40,
            variable_bolus_rate: true,
        }
    }
}

/// Clinician-configured pharmacodynamic profile. Read-only per cycle;
/// overrides are applied to a clone.
#[derive(Debug, Clone)]
pub struct Profile {
    /// ISF, mg/dL per unit.
    pub sens: f64,
    /// Grams per unit.
    pub carb_ratio: f64,
    pub basal: BasalSchedule,
    pub targets: Targets,
    pub max_iob: f64,
    pub max_basal: f64,
    pub max_daily_safety_multiplier: f64,
    pub current_basal_safety_multiplier: f64,
    pub basal_increment: f64,
    pub insulin: InsulinCfg,
    pub sensitivity: SensitivityCfg,
    pub dynamic_isf: DynamicIsfCfg,
    pub smb: SmbCfg,
    pub carbs: CarbsCfg,
    pub safety: SafetyCfg,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            sens: 50.0,
            carb_ratio: 10.0,
            basal: BasalSchedule::flat(1.0),
            targets: Targets::default(),
            max_iob: 3.0,
            max_basal: 3.0,
            max_daily_safety_multiplier: 3.0,
            current_basal_safety_multiplier: 4.0,
            basal_increment: 0.05,
            insulin: InsulinCfg::default(),
            sensitivity: SensitivityCfg::default(),
            dynamic_isf: DynamicIsfCfg::default(),
            smb: SmbCfg::default(),
            carbs: CarbsCfg::default(),
            safety: SafetyCfg::default(),
        }
    }
}

impl Profile {
    /// Reject settings the decision engine must never run with.
    pub fn validate(&self) -> Result<(), ApsError> {
        if !(self.carb_ratio.is_finite() && self.carb_ratio > 0.1) {
            return Err(ApsError::Config(format!(
                "carb ratio {} must be > 0.1",
                self.carb_ratio
            )));
        }
        if !(self.sens.is_finite() && self.sens > 0.0) {
            return Err(ApsError::Config(format!("ISF {} must be > 0", self.sens)));
        }
        if !(self.max_basal.is_finite() && self.max_basal > 0.0) {
            return Err(ApsError::Config("max basal must be > 0".into()));
        }
        if !(self.max_iob.is_finite() && self.max_iob >= 0.0) {
            return Err(ApsError::Config("max IOB must be >= 0".into()));
        }
        if self.targets.min_bg > self.targets.max_bg || self.targets.min_bg <= 0.0 {
            return Err(ApsError::Config("target range is inverted or empty".into()));
        }
        if self.insulin.dia_hours < 3.0 {
            return Err(ApsError::Config("DIA must be >= 3h".into()));
        }
        if self.basal.max_daily_rate() <= 0.0 {
            return Err(ApsError::Config("basal schedule delivers no insulin".into()));
        }
        Ok(())
    }

    /// Scheduled basal at `t`.
    pub fn current_basal(&self, t: DateTime<Utc>) -> f64 {
        self.basal.rate_at(t)
    }

    /// Carb sensitivity factor, mg/dL per gram.
    pub fn csf(&self) -> f64 {
        self.sens / self.carb_ratio
    }
}
