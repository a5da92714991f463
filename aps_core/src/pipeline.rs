//! One control cycle, end to end.
//!
//! `CycleInputs::builder()` enforces at compile time that a profile, glucose
//! history, and a clock are provided before `build()` is available.
//! `try_build()` is always available for dynamic checks.
//!
//! [`run_cycle`] runs the stages strictly in order: overrides, dose timeline,
//! IOB, COB, TDD, sensitivity, middleware, decision.

use std::marker::PhantomData;
use std::sync::Arc;

use aps_traits::{Clock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::cob::{CobResult, calculate_cob};
use crate::config::Profile;
use crate::determine_basal::{DecisionInputs, determine_basal};
use crate::error::{BuildError, Result};
use crate::glucose::GlucoseStatus;
use crate::history::DoseTimeline;
use crate::iob::{ActivityCurve, IobSnapshot, iob_trajectory};
use crate::middleware::{MiddlewareContext, ProfileMiddleware, apply_middleware};
use crate::overrides::{ProfileOverride, TempTarget, apply_override, exercise_ratio};
use crate::sensitivity::{
    AutosensResult, SensitivityContext, TddCalculator, TddSummary, clamp_ratio,
    resolve_sensitivity,
};
use crate::status::DoseState;
use crate::suggestion::Suggestion;
use crate::types::{CarbEntry, CurrentTemp, GlucoseSample, PumpHistoryEvent, UnfinalizedDose};
use crate::util::round_to;

/// Dose history reaches back this far before the DIA window so autosens
/// sees a full day of insulin effect.
const LOOKBACK_HOURS: i64 = 24;

/// Everything one cycle reads. Built once, never mutated by the cycle.
pub struct CycleInputs {
    profile: Profile,
    glucose: Vec<GlucoseSample>,
    history: Vec<PumpHistoryEvent>,
    ledger: Vec<UnfinalizedDose>,
    carbs: Vec<CarbEntry>,
    current_temp: CurrentTemp,
    reservoir: Option<f64>,
    pump_updated_at: Option<DateTime<Utc>>,
    history_start: Option<DateTime<Utc>>,
    microbolus_allowed: bool,
    profile_override: Option<ProfileOverride>,
    temp_target: Option<TempTarget>,
    middleware: Option<Arc<dyn ProfileMiddleware>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl core::fmt::Debug for CycleInputs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CycleInputs")
            .field("glucose", &self.glucose.len())
            .field("history", &self.history.len())
            .field("ledger", &self.ledger.len())
            .field("carbs", &self.carbs.len())
            .field("current_temp", &self.current_temp)
            .field("middleware", &self.middleware.as_ref().map(|m| m.name().to_string()))
            .finish_non_exhaustive()
    }
}

/// What the cycle computed, alongside the suggestion.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutput {
    pub suggestion: Suggestion,
    pub glucose_status: Option<GlucoseStatus>,
    pub iob: IobSnapshot,
    pub meal: CobResult,
    pub autosens: AutosensResult,
    pub tdd: TddSummary,
}

impl CycleInputs {
    /// Start building cycle inputs.
    pub fn builder() -> CycleInputsBuilder<Missing, Missing, Missing> {
        CycleInputsBuilder::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }
}

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `CycleInputs`. Validated on `build()`.
pub struct CycleInputsBuilder<P, G, C> {
    profile: Option<Profile>,
    glucose: Option<Vec<GlucoseSample>>,
    history: Vec<PumpHistoryEvent>,
    ledger: Vec<UnfinalizedDose>,
    carbs: Vec<CarbEntry>,
    current_temp: CurrentTemp,
    reservoir: Option<f64>,
    pump_updated_at: Option<DateTime<Utc>>,
    history_start: Option<DateTime<Utc>>,
    microbolus_allowed: bool,
    profile_override: Option<ProfileOverride>,
    temp_target: Option<TempTarget>,
    middleware: Option<Arc<dyn ProfileMiddleware>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    _p: PhantomData<P>,
    _g: PhantomData<G>,
    _c: PhantomData<C>,
}

impl Default for CycleInputsBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            profile: None,
            glucose: None,
            history: Vec::new(),
            ledger: Vec::new(),
            carbs: Vec::new(),
            current_temp: CurrentTemp::default(),
            reservoir: None,
            pump_updated_at: None,
            history_start: None,
            microbolus_allowed: false,
            profile_override: None,
            temp_target: None,
            middleware: None,
            clock: None,
            _p: PhantomData,
            _g: PhantomData,
            _c: PhantomData,
        }
    }
}

impl<P, G, C> CycleInputsBuilder<P, G, C> {
    fn retype<P2, G2, C2>(self) -> CycleInputsBuilder<P2, G2, C2> {
        CycleInputsBuilder {
            profile: self.profile,
            glucose: self.glucose,
            history: self.history,
            ledger: self.ledger,
            carbs: self.carbs,
            current_temp: self.current_temp,
            reservoir: self.reservoir,
            pump_updated_at: self.pump_updated_at,
            history_start: self.history_start,
            microbolus_allowed: self.microbolus_allowed,
            profile_override: self.profile_override,
            temp_target: self.temp_target,
            middleware: self.middleware,
            clock: self.clock,
            _p: PhantomData,
            _g: PhantomData,
            _c: PhantomData,
        }
    }

    pub fn profile(mut self, profile: Profile) -> CycleInputsBuilder<Set, G, C> {
        self.profile = Some(profile);
        self.retype()
    }

    pub fn glucose(mut self, samples: Vec<GlucoseSample>) -> CycleInputsBuilder<P, Set, C> {
        self.glucose = Some(samples);
        self.retype()
    }

    pub fn clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> CycleInputsBuilder<P, G, Set> {
        self.clock = Some(clock);
        self.retype()
    }

    /// Use the wall clock.
    pub fn system_clock(self) -> CycleInputsBuilder<P, G, Set> {
        self.clock(Arc::new(SystemClock::new()))
    }

    /// Fallible build available in any type-state; names the missing piece.
    pub fn try_build(self) -> Result<CycleInputs> {
        let profile = self
            .profile
            .ok_or_else(|| eyre::Report::new(BuildError::MissingProfile))?;
        let glucose = self
            .glucose
            .ok_or_else(|| eyre::Report::new(BuildError::MissingGlucose))?;
        let clock = self
            .clock
            .ok_or_else(|| eyre::Report::new(BuildError::MissingClock))?;

        // ── Validation ───────────────────────────────────────────────────────
        if self
            .reservoir
            .is_some_and(|r| !r.is_finite() || r.is_sign_negative())
        {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "reservoir must be >= 0",
            )));
        }
        if !(self.current_temp.rate.is_finite()
            && self.current_temp.rate >= 0.0
            && self.current_temp.duration >= 0.0)
        {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "current temp rate and duration must be >= 0",
            )));
        }
        if self
            .carbs
            .iter()
            .any(|c| !c.carbs.is_finite() || c.carbs.is_sign_negative())
        {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "carb entries must be >= 0 g",
            )));
        }

        Ok(CycleInputs {
            profile,
            glucose,
            history: self.history,
            ledger: self.ledger,
            carbs: self.carbs,
            current_temp: self.current_temp,
            reservoir: self.reservoir,
            pump_updated_at: self.pump_updated_at,
            history_start: self.history_start,
            microbolus_allowed: self.microbolus_allowed,
            profile_override: self.profile_override,
            temp_target: self.temp_target,
            middleware: self.middleware,
            clock,
        })
    }
}

impl CycleInputsBuilder<Set, Set, Set> {
    /// Infallible in type-state terms; still validates values.
    pub fn build(self) -> Result<CycleInputs> {
        self.try_build()
    }
}

/// Chainable setters that do not affect type-state.
impl<P, G, C> CycleInputsBuilder<P, G, C> {
    pub fn history(mut self, events: Vec<PumpHistoryEvent>) -> Self {
        self.history = events;
        self
    }
    pub fn ledger(mut self, doses: Vec<UnfinalizedDose>) -> Self {
        self.ledger = doses;
        self
    }
    pub fn carbs(mut self, carbs: Vec<CarbEntry>) -> Self {
        self.carbs = carbs;
        self
    }
    pub fn current_temp(mut self, temp: CurrentTemp) -> Self {
        self.current_temp = temp;
        self
    }
    pub fn reservoir(mut self, units: f64) -> Self {
        self.reservoir = Some(units);
        self
    }
    /// When pump history was last refreshed. Without it the newest history
    /// event or ledger dose stands in; with neither the cycle fails safe.
    pub fn pump_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.pump_updated_at = Some(at);
        self
    }
    /// Start of the recorded history, for TDD coverage.
    pub fn history_start(mut self, at: DateTime<Utc>) -> Self {
        self.history_start = Some(at);
        self
    }
    pub fn microbolus_allowed(mut self, allowed: bool) -> Self {
        self.microbolus_allowed = allowed;
        self
    }
    pub fn profile_override(mut self, ov: ProfileOverride) -> Self {
        self.profile_override = Some(ov);
        self
    }
    pub fn temp_target(mut self, tt: TempTarget) -> Self {
        self.temp_target = Some(tt);
        self
    }
    pub fn middleware(mut self, mw: Arc<dyn ProfileMiddleware>) -> Self {
        self.middleware = Some(mw);
        self
    }
}

/// Newest time the pump is known to have reported or accepted a command.
fn last_pump_contact(inputs: &CycleInputs) -> Option<DateTime<Utc>> {
    let events = inputs.history.iter().map(|e| e.timestamp);
    let doses = inputs.ledger.iter().map(|d| d.start_time);
    events.chain(doses).max()
}

/// Sensitivity implied by an exercise temp target, if one applies.
fn exercise_sensitivity(profile: &Profile, tt: Option<&TempTarget>) -> Option<AutosensResult> {
    let tt = tt?;
    let raw = exercise_ratio(&profile.sensitivity, tt.target())?;
    let ratio = clamp_ratio(raw, &profile.sensitivity, "temp_target");
    Some(AutosensResult {
        ratio,
        pre_clamp_ratio: raw,
        insufficient_data: false,
        reason: Some(format!("temp target {:.0} sets ratio {ratio:.2}", tt.target())),
        adjusted_isf: round_to(profile.sens / ratio, 1),
        adjusted_cr: None,
    })
}

/// Run one control cycle.
///
/// Invalid configuration is the only error; every data problem yields a
/// conservative suggestion with a reason.
pub fn run_cycle(inputs: &CycleInputs) -> Result<CycleOutput> {
    let now = inputs.clock.now();
    inputs.profile.validate()?;

    let adjusted = apply_override(
        &inputs.profile,
        inputs.profile_override.as_ref(),
        inputs.temp_target.as_ref(),
    );
    let profile = &adjusted.profile;

    let timeline = DoseTimeline::build(&inputs.history, &inputs.ledger, now);
    let curve = ActivityCurve::new(&profile.insulin);
    let dia = Duration::minutes(curve.end_minutes().ceil() as i64);
    let from = now - dia - Duration::hours(LOOKBACK_HOURS);
    let doses = timeline.net_insulin_doses(&profile.basal, from, now);
    let trajectory = iob_trajectory(&doses, &curve, now);
    let iob_now = trajectory.first().copied().unwrap_or_else(|| IobSnapshot::empty(now));

    let glucose_status = GlucoseStatus::from_samples(&inputs.glucose);
    let meal = calculate_cob(&inputs.carbs, &inputs.glucose, &doses, &curve, profile, now);
    let tdd = TddCalculator::new(profile).calculate(&timeline, &profile.basal, inputs.history_start, now);

    let autosens = match exercise_sensitivity(profile, inputs.temp_target.as_ref()) {
        Some(r) => r,
        None => resolve_sensitivity(
            profile,
            &SensitivityContext {
                glucose: &inputs.glucose,
                doses: &doses,
                curve: &curve,
                carbs: &inputs.carbs,
                tdd: Some(&tdd),
                current_bg: glucose_status.map(|g| g.glucose),
                target_bg: profile.targets.target_bg(),
                exercising: adjusted.exercising,
                now,
            },
        ),
    };

    let mut notes = adjusted.notes.clone();
    let (profile, autosens) = match &inputs.middleware {
        Some(mw) => {
            let out = apply_middleware(
                mw.as_ref(),
                profile,
                &autosens,
                &MiddlewareContext {
                    glucose: glucose_status.as_ref(),
                    iob: Some(&iob_now),
                    meal: &meal,
                    tdd: Some(&tdd),
                    exercising: adjusted.exercising,
                    now,
                },
            );
            notes.extend(out.reason);
            (out.profile, out.autosens)
        }
        None => (profile.clone(), autosens),
    };

    let uncertain = inputs
        .ledger
        .iter()
        .filter(|d| d.state == DoseState::Uncertain)
        .count();
    let mut suggestion = determine_basal(&DecisionInputs {
        glucose: glucose_status.as_ref(),
        current_temp: inputs.current_temp,
        iob: &trajectory,
        profile: &profile,
        autosens: &autosens,
        meal: &meal,
        microbolus_allowed: inputs.microbolus_allowed,
        smb_disabled: adjusted.smb_disabled,
        temp_target_active: adjusted.temp_target_active,
        reservoir: inputs.reservoir,
        pump_updated_at: inputs.pump_updated_at.or_else(|| last_pump_contact(inputs)),
        uncertain_doses: uncertain,
        now,
    })?;
    if let Some(r) = &autosens.reason {
        notes.push(r.clone());
    }
    if !notes.is_empty() {
        suggestion.reason = format!("{}; {}", suggestion.reason, notes.join("; "));
    }
    tracing::info!(
        bg = ?suggestion.bg,
        eventual = ?suggestion.eventual_bg,
        iob = iob_now.iob,
        cob = meal.cob,
        ratio = autosens.ratio,
        temp = ?suggestion.temp,
        units = ?suggestion.units,
        fail_safe = suggestion.fail_safe,
        "cycle complete"
    );

    Ok(CycleOutput {
        suggestion,
        glucose_status,
        iob: iob_now,
        meal,
        autosens,
        tdd,
    })
}
