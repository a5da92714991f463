//! Profile overrides, temp targets, and exercise mode.
//!
//! Everything here works on a clone of the profile; the caller's profile is
//! never mutated.

use serde::{Deserialize, Serialize};

use crate::config::{Profile, SensitivityCfg, Targets};
use crate::util::{clamp_f64, round_to};

/// Temp targets at or above this count as exercise.
pub const EXERCISE_TARGET: f64 = 118.0;
/// Override targets with these values mean "no target change".
const NO_TARGET: [f64; 2] = [0.0, 6.0];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    #[default]
    IsfAndCr,
    Isf,
    Cr,
    BasalOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverride {
    /// 100 leaves insulin unchanged.
    pub percentage: f64,
    #[serde(default)]
    pub scope: OverrideScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(default)]
    pub smb_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smb_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uam_minutes: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempTarget {
    pub low: f64,
    pub high: f64,
}

impl TempTarget {
    pub fn target(&self) -> f64 {
        f64::midpoint(self.low, self.high)
    }
}

/// A profile with overrides and temp targets folded in.
#[derive(Debug, Clone)]
pub struct Adjusted {
    pub profile: Profile,
    pub smb_disabled: bool,
    pub temp_target_active: bool,
    pub exercising: bool,
    pub notes: Vec<String>,
}

/// High temp target with exercise mode or high-target sensitivity enabled.
pub fn exercise_active(cfg: &SensitivityCfg, temp_target: Option<&TempTarget>) -> bool {
    temp_target.is_some_and(|tt| {
        (cfg.exercise_mode || cfg.high_temptarget_raises_sensitivity)
            && tt.target() >= EXERCISE_TARGET
    })
}

/// Sensitivity ratio implied by a temp target, if the profile enables it.
///
/// `c = half_basal_exercise_target − 100; ratio = c / (c + target − 100)`,
/// capped at `autosens_max`.
pub fn exercise_ratio(cfg: &SensitivityCfg, target: f64) -> Option<f64> {
    let high = (cfg.high_temptarget_raises_sensitivity || cfg.exercise_mode) && target > 100.0;
    let low = cfg.low_temptarget_lowers_sensitivity && target < 100.0;
    if !(high || low) {
        return None;
    }
    let c = cfg.half_basal_exercise_target - 100.0;
    let denom = c + target - 100.0;
    if c <= 0.0 || denom <= 0.0 {
        return Some(cfg.autosens_max);
    }
    Some(round_to((c / denom).min(cfg.autosens_max), 2))
}

/// Move the target range with the sensitivity ratio when configured.
///
/// Returns `None` when the targets stay as they are.
pub fn adjust_targets_for_ratio(
    targets: &Targets,
    ratio: f64,
    cfg: &SensitivityCfg,
    temp_target_active: bool,
) -> Option<Targets> {
    if temp_target_active || ratio <= 0.0 || (ratio - 1.0).abs() < f64::EPSILON {
        return None;
    }
    let applies = (ratio < 1.0 && cfg.sensitivity_raises_target)
        || (ratio > 1.0 && cfg.resistance_lowers_target);
    if !applies {
        return None;
    }
    let shift = |bg: f64| ((bg - 60.0) / ratio).round() + 60.0;
    Some(Targets {
        min_bg: shift(targets.min_bg),
        max_bg: shift(targets.max_bg),
    })
}

/// Apply an override and/or temp target to a clone of `profile`.
pub fn apply_override(
    profile: &Profile,
    ov: Option<&ProfileOverride>,
    temp_target: Option<&TempTarget>,
) -> Adjusted {
    let mut p = profile.clone();
    let mut notes = Vec::new();
    let mut smb_disabled = false;

    if let Some(tt) = temp_target {
        p.targets = Targets {
            min_bg: tt.low.min(tt.high),
            max_bg: tt.high.max(tt.low),
        };
        notes.push(format!("temp target {:.0}-{:.0}", tt.low, tt.high));
    }

    if let Some(ov) = ov {
        let factor = clamp_f64(ov.percentage, 10.0, 300.0) / 100.0;
        if (factor - 1.0).abs() > f64::EPSILON {
            p.basal = p.basal.map_rates(|r| r * factor);
            match ov.scope {
                OverrideScope::IsfAndCr => {
                    p.sens /= factor;
                    p.carb_ratio /= factor;
                }
                OverrideScope::Isf => p.sens /= factor,
                OverrideScope::Cr => p.carb_ratio /= factor,
                OverrideScope::BasalOnly => {}
            }
            notes.push(format!("override {:.0}%", ov.percentage));
        }
        if let Some(target) = ov.target.filter(|t| !NO_TARGET.contains(t)) {
            if temp_target.is_none() {
                p.targets = Targets {
                    min_bg: target,
                    max_bg: target,
                };
                notes.push(format!("override target {target:.0}"));
            }
        }
        if let Some(max_iob) = ov.max_iob {
            p.max_iob = max_iob;
        }
        if let Some(m) = ov.smb_minutes {
            p.smb.max_smb_basal_minutes = m;
        }
        if let Some(m) = ov.uam_minutes {
            p.smb.max_uam_smb_basal_minutes = m;
        }
        smb_disabled = ov.smb_disabled;
    }

    let exercising = exercise_active(&p.sensitivity, temp_target);
    Adjusted {
        profile: p,
        smb_disabled,
        temp_target_active: temp_target.is_some(),
        exercising,
        notes,
    }
}
