//! Injected profile middleware.
//!
//! A middleware may tweak the effective profile and the sensitivity result
//! right before the decision engine runs. It is sandboxed: an error, a
//! panic, an output profile that fails validation, or a non-positive ratio
//! falls back to the unmodified inputs with the failure logged and recorded
//! in the reason. A usable ratio is still clamped to the configured bounds.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};

use crate::cob::CobResult;
use crate::config::Profile;
use crate::error::ApsError;
use crate::glucose::GlucoseStatus;
use crate::iob::IobSnapshot;
use crate::sensitivity::{AutosensResult, TddSummary, clamp_ratio};
use crate::sensitivity::tdd::RELIABLE_HOURS;
use crate::util::round_to;

/// Read-only view of the cycle handed to a middleware.
#[derive(Debug, Clone, Copy)]
pub struct MiddlewareContext<'a> {
    pub glucose: Option<&'a GlucoseStatus>,
    pub iob: Option<&'a IobSnapshot>,
    pub meal: &'a CobResult,
    pub tdd: Option<&'a TddSummary>,
    pub exercising: bool,
    pub now: DateTime<Utc>,
}

/// Strategy hook run once per cycle.
pub trait ProfileMiddleware: Send + Sync {
    fn name(&self) -> &str;

    /// Adjust `profile` and `autosens` in place; the returned text is
    /// appended to the cycle's rationale.
    fn apply(
        &self,
        profile: &mut Profile,
        autosens: &mut AutosensResult,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Option<String>, ApsError>;
}

#[derive(Debug, Clone)]
pub struct MiddlewareOutcome {
    pub profile: Profile,
    pub autosens: AutosensResult,
    pub reason: Option<String>,
    /// The middleware failed and the inputs were passed through.
    pub fell_back: bool,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Hold a middleware's ratio to the same bounds every other source obeys
/// and keep the derived ISF and CR consistent with it.
fn bound_ratio(a: &mut AutosensResult, p: &Profile, source: &str) {
    let ratio = clamp_ratio(a.ratio, &p.sensitivity, source);
    if (ratio - a.ratio).abs() > f64::EPSILON {
        a.pre_clamp_ratio = round_to(a.ratio, 2);
        a.ratio = ratio;
        a.adjusted_isf = round_to(p.sens / ratio, 1);
        a.adjusted_cr = a.adjusted_cr.map(|_| round_to(p.carb_ratio / ratio, 1));
    }
}

/// Run `mw` on copies of the inputs.
pub fn apply_middleware(
    mw: &dyn ProfileMiddleware,
    profile: &Profile,
    autosens: &AutosensResult,
    ctx: &MiddlewareContext<'_>,
) -> MiddlewareOutcome {
    let run = catch_unwind(AssertUnwindSafe(|| {
        let mut p = profile.clone();
        let mut a = autosens.clone();
        mw.apply(&mut p, &mut a, ctx).map(|reason| (p, a, reason))
    }));
    let failure = match run {
        Ok(Ok((p, mut a, reason))) => match p.validate() {
            Ok(()) if !(a.ratio.is_finite() && a.ratio > 0.0) => {
                format!("produced an unusable sensitivity ratio {}", a.ratio)
            }
            Ok(()) => {
                bound_ratio(&mut a, &p, mw.name());
                tracing::debug!(middleware = mw.name(), ?reason, ratio = a.ratio, "middleware applied");
                return MiddlewareOutcome {
                    profile: p,
                    autosens: a,
                    reason,
                    fell_back: false,
                };
            }
            Err(e) => format!("produced an invalid profile: {e}"),
        },
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    tracing::warn!(middleware = mw.name(), %failure, "middleware failed, using unmodified profile");
    MiddlewareOutcome {
        profile: profile.clone(),
        autosens: autosens.clone(),
        reason: Some(format!("middleware {} failed: {failure}", mw.name())),
        fell_back: true,
    }
}

/// Sensitivity from TDD and current glucose:
/// `ratio = sens / (277700 / (adjustment_factor × TDD × BG))`.
#[derive(Debug, Clone, Copy)]
pub struct TddRatioMiddleware {
    pub adjustment_factor: f64,
}

impl Default for TddRatioMiddleware {
    fn default() -> Self {
        Self {
            adjustment_factor: 1.0,
        }
    }
}

impl ProfileMiddleware for TddRatioMiddleware {
    fn name(&self) -> &str {
        "tdd_ratio"
    }

    fn apply(
        &self,
        profile: &mut Profile,
        autosens: &mut AutosensResult,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Option<String>, ApsError> {
        if ctx.exercising {
            return Ok(Some("tdd_ratio: off while exercising".into()));
        }
        let Some(tdd) = ctx.tdd.filter(|t| t.hours_covered >= RELIABLE_HOURS) else {
            return Ok(Some(format!(
                "tdd_ratio: off, less than {RELIABLE_HOURS}h of history"
            )));
        };
        let Some(gs) = ctx.glucose else {
            return Ok(Some("tdd_ratio: off, no glucose".into()));
        };
        let tdd_units = tdd.weighted_average;
        if tdd_units <= 0.0 || gs.glucose <= 0.0 {
            return Ok(Some("tdd_ratio: off, no insulin in history".into()));
        }
        let raw = profile.sens / (277_700.0 / (self.adjustment_factor * tdd_units * gs.glucose));
        let ratio = clamp_ratio(raw, &profile.sensitivity, "tdd_ratio");
        autosens.pre_clamp_ratio = round_to(raw, 2);
        autosens.ratio = ratio;
        autosens.adjusted_isf = round_to(profile.sens / ratio, 1);
        Ok(Some(format!(
            "tdd_ratio: TDD {tdd_units:.1}U, BG {:.0}, ratio {ratio:.2}",
            gs.glucose
        )))
    }
}
