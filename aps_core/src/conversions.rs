//! `From` implementations bridging `aps_config` types to `aps_core` types.
//!
//! The basal schedule is the only fallible piece, so the full profile is a
//! `TryFrom<&aps_config::Config>`.

use chrono::Duration;

use crate::config::{
    BasalEntry, BasalSchedule, CarbsCfg, CurveKind, DynamicIsfCfg, InsulinCfg, Profile,
    ReconcileCfg, SafetyCfg, SensitivityCfg, SensitivityMode, SmbCfg, Targets,
};
use crate::error::ApsError;

// ── InsulinCfg ───────────────────────────────────────────────────────────────

impl From<aps_config::CurveKind> for CurveKind {
    fn from(c: aps_config::CurveKind) -> Self {
        match c {
            aps_config::CurveKind::Bilinear => Self::Bilinear,
            aps_config::CurveKind::RapidActing => Self::RapidActing,
            aps_config::CurveKind::UltraRapid => Self::UltraRapid,
        }
    }
}

impl From<&aps_config::InsulinCfg> for InsulinCfg {
    fn from(c: &aps_config::InsulinCfg) -> Self {
        Self {
            curve: c.curve.into(),
            dia_hours: c.dia_hours,
            custom_peak_minutes: c.use_custom_peak_time.then_some(c.insulin_peak_time),
        }
    }
}

// ── Targets ──────────────────────────────────────────────────────────────────

impl From<&aps_config::TargetsCfg> for Targets {
    fn from(c: &aps_config::TargetsCfg) -> Self {
        Self {
            min_bg: c.min_bg,
            max_bg: c.max_bg,
        }
    }
}

// ── SensitivityCfg ───────────────────────────────────────────────────────────

impl From<aps_config::SensitivityMode> for SensitivityMode {
    fn from(m: aps_config::SensitivityMode) -> Self {
        match m {
            aps_config::SensitivityMode::Off => Self::Off,
            aps_config::SensitivityMode::Autosens => Self::Autosens,
            aps_config::SensitivityMode::DynamicIsf => Self::DynamicIsf,
            aps_config::SensitivityMode::Autotuned => Self::Autotuned,
        }
    }
}

impl From<&aps_config::SensitivityCfg> for SensitivityCfg {
    fn from(c: &aps_config::SensitivityCfg) -> Self {
        Self {
            mode: c.mode.into(),
            autosens_min: c.autosens_min,
            autosens_max: c.autosens_max,
            resistance_lowers_target: c.resistance_lowers_target,
            sensitivity_raises_target: c.sensitivity_raises_target,
            exercise_mode: c.exercise_mode,
            high_temptarget_raises_sensitivity: c.high_temptarget_raises_sensitivity,
            low_temptarget_lowers_sensitivity: c.low_temptarget_lowers_sensitivity,
            half_basal_exercise_target: c.half_basal_exercise_target,
        }
    }
}

// ── DynamicIsfCfg ────────────────────────────────────────────────────────────

impl From<&aps_config::DynamicIsfCfg> for DynamicIsfCfg {
    fn from(c: &aps_config::DynamicIsfCfg) -> Self {
        Self {
            sigmoid: c.sigmoid,
            adjustment_factor: c.adjustment_factor,
            adjustment_factor_sigmoid: c.adjustment_factor_sigmoid,
            weight_percentage: c.weight_percentage,
            enable_dynamic_cr: c.enable_dynamic_cr,
        }
    }
}

// ── SmbCfg ───────────────────────────────────────────────────────────────────

impl From<&aps_config::SmbCfg> for SmbCfg {
    fn from(c: &aps_config::SmbCfg) -> Self {
        Self {
            enable_always: c.enable_always,
            enable_with_cob: c.enable_with_cob,
            allow_with_high_temptarget: c.allow_with_high_temptarget,
            max_smb_basal_minutes: c.max_smb_basal_minutes,
            max_uam_smb_basal_minutes: c.max_uam_smb_basal_minutes,
            smb_interval_min: c.smb_interval_min,
            smb_delivery_ratio: c.smb_delivery_ratio,
            bolus_increment: c.bolus_increment,
        }
    }
}

// ── CarbsCfg ─────────────────────────────────────────────────────────────────

impl From<&aps_config::CarbsCfg> for CarbsCfg {
    fn from(c: &aps_config::CarbsCfg) -> Self {
        Self {
            min_5m_carbimpact: c.min_5m_carbimpact,
            max_cob: c.max_cob,
            default_absorption_hours: c.default_absorption_hours,
            max_absorption_factor: c.max_absorption_factor,
        }
    }
}

// ── SafetyCfg ────────────────────────────────────────────────────────────────

impl From<&aps_config::SafetyCfg> for SafetyCfg {
    fn from(c: &aps_config::SafetyCfg) -> Self {
        Self {
            max_glucose_age_min: c.max_glucose_age_min,
            max_pump_age_min: c.max_pump_age_min,
            min_reservoir_units: c.min_reservoir_units,
            low_glucose_suspend: c.low_glucose_suspend,
        }
    }
}

// ── ReconcileCfg ─────────────────────────────────────────────────────────────

fn secs(n: u64) -> Duration {
    i64::try_from(n)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

impl From<&aps_config::ReconcileCfg> for ReconcileCfg {
    fn from(c: &aps_config::ReconcileCfg) -> Self {
        Self {
            match_window: secs(c.match_window_secs),
            uncertainty_window: secs(c.uncertainty_window_min.saturating_mul(60)),
            mapping_retention: secs(c.mapping_retention_hours.saturating_mul(3600)),
            pulses_per_unit: c.pulses_per_unit,
            variable_bolus_rate: c.variable_bolus_rate,
        }
    }
}

// ── Profile ──────────────────────────────────────────────────────────────────

impl TryFrom<&aps_config::Config> for BasalSchedule {
    type Error = ApsError;

    fn try_from(c: &aps_config::Config) -> Result<Self, ApsError> {
        let entries = c
            .basal
            .schedule
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let minutes = row
                    .minutes()
                    .map_err(|e| ApsError::Config(format!("basal.schedule[{i}].start: {e}")))?;
                Ok(BasalEntry {
                    minutes,
                    rate: row.rate,
                })
            })
            .collect::<Result<Vec<_>, ApsError>>()?;
        Self::new(entries, c.profile.utc_offset_minutes)
    }
}

impl TryFrom<&aps_config::Config> for Profile {
    type Error = ApsError;

    fn try_from(c: &aps_config::Config) -> Result<Self, ApsError> {
        let p = &c.profile;
        Ok(Self {
            sens: p.sens,
            carb_ratio: p.carb_ratio,
            basal: BasalSchedule::try_from(c)?,
            targets: (&c.targets).into(),
            max_iob: p.max_iob,
            max_basal: p.max_basal,
            max_daily_safety_multiplier: p.max_daily_safety_multiplier,
            current_basal_safety_multiplier: p.current_basal_safety_multiplier,
            basal_increment: p.basal_increment,
            insulin: (&c.insulin).into(),
            sensitivity: (&c.sensitivity).into(),
            dynamic_isf: (&c.dynamic_isf).into(),
            smb: (&c.smb).into(),
            carbs: (&c.carbs).into(),
            safety: (&c.safety).into(),
        })
    }
}
