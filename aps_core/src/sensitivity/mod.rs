//! Sensitivity layer: one ratio per cycle, from whichever source the
//! profile selects.
//!
//! A ratio above 1 means the user currently needs more insulin (resistant),
//! below 1 less (sensitive). Every source is clamped to
//! `[autosens_min, autosens_max]` through [`clamp_ratio`].

pub mod autosens;
pub mod autotune;
pub mod dynamic_isf;
pub mod tdd;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Profile, SensitivityCfg, SensitivityMode};
use crate::history::InsulinDose;
use crate::iob::ActivityCurve;
use crate::types::{CarbEntry, GlucoseSample};
use crate::util::{clamp_f64, round_to};

pub use tdd::{TddCalculator, TddSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutosensResult {
    pub ratio: f64,
    /// Ratio before clamping to the configured bounds.
    pub pre_clamp_ratio: f64,
    #[serde(default)]
    pub insufficient_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// ISF after applying the ratio.
    pub adjusted_isf: f64,
    /// Carb ratio after applying the ratio, when dynamic CR is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_cr: Option<f64>,
}

impl AutosensResult {
    /// Ratio 1 with the profile's own ISF.
    pub fn neutral(sens: f64, reason: Option<String>) -> Self {
        Self {
            ratio: 1.0,
            pre_clamp_ratio: 1.0,
            insufficient_data: false,
            reason,
            adjusted_isf: sens,
            adjusted_cr: None,
        }
    }

    pub fn insufficient(sens: f64, reason: String) -> Self {
        Self {
            insufficient_data: true,
            ..Self::neutral(sens, Some(reason))
        }
    }
}

/// Round a raw ratio to two decimals, then clamp it to the configured
/// bounds, logging when the clamp bites. The result is always within
/// `[autosens_min, autosens_max]`, even for bounds with more decimals.
pub fn clamp_ratio(raw: f64, cfg: &SensitivityCfg, source: &str) -> f64 {
    let rounded = round_to(raw, 2);
    let clamped = clamp_f64(rounded, cfg.autosens_min, cfg.autosens_max);
    if (clamped - rounded).abs() > f64::EPSILON || rounded.is_nan() {
        tracing::info!(
            source,
            pre_clamp = raw,
            ratio = clamped,
            min = cfg.autosens_min,
            max = cfg.autosens_max,
            "sensitivity ratio clamped"
        );
    }
    clamped
}

/// Everything a sensitivity source may look at in one cycle.
#[derive(Debug, Clone, Copy)]
pub struct SensitivityContext<'a> {
    pub glucose: &'a [GlucoseSample],
    pub doses: &'a [InsulinDose],
    pub curve: &'a ActivityCurve,
    pub carbs: &'a [CarbEntry],
    pub tdd: Option<&'a TddSummary>,
    /// Latest glucose, mg/dL.
    pub current_bg: Option<f64>,
    /// Target used by the sigmoid formula.
    pub target_bg: f64,
    pub exercising: bool,
    pub now: DateTime<Utc>,
}

/// Ratio for this cycle according to `profile.sensitivity.mode`.
pub fn resolve_sensitivity(profile: &Profile, ctx: &SensitivityContext<'_>) -> AutosensResult {
    let result = match profile.sensitivity.mode {
        SensitivityMode::Off => AutosensResult::neutral(profile.sens, None),
        SensitivityMode::Autotuned => {
            AutosensResult::neutral(profile.sens, Some("autotuned profile, ratio 1".to_string()))
        }
        SensitivityMode::Autosens => autosens::detect_sensitivity(
            ctx.glucose,
            ctx.doses,
            ctx.curve,
            ctx.carbs,
            profile,
            ctx.now,
        ),
        SensitivityMode::DynamicIsf => dynamic_isf::dynamic_isf(
            profile,
            ctx.current_bg,
            ctx.target_bg,
            ctx.tdd,
            ctx.exercising,
        ),
    };
    tracing::debug!(
        mode = ?profile.sensitivity.mode,
        ratio = result.ratio,
        isf = result.adjusted_isf,
        "sensitivity resolved"
    );
    result
}
