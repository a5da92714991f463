#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and basal schedule parsing for the insulin decision core.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - The basal schedule CSV loader enforces headers and reports the offending
//!   row on any parse error.
use serde::Deserialize;

/// Basal schedule CSV schema.
///
/// Expected headers:
/// start,rate
///
/// Example:
/// start,rate
/// 00:00,0.8
/// 06:30,1.05
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BasalRow {
    /// Time of day, `HH:MM` or `HH:MM:SS`, in the profile's local offset.
    pub start: String,
    /// Units per hour.
    pub rate: f64,
}

impl BasalRow {
    /// Minutes after local midnight at which this entry starts.
    pub fn minutes(&self) -> eyre::Result<u32> {
        parse_time_of_day(&self.start)
    }
}

/// Parse `HH:MM[:SS]` into minutes after midnight (seconds are truncated).
pub fn parse_time_of_day(s: &str) -> eyre::Result<u32> {
    let mut parts = s.trim().split(':');
    let h: u32 = parts
        .next()
        .ok_or_else(|| eyre::eyre!("empty time of day"))?
        .parse()
        .map_err(|e| eyre::eyre!("invalid hour in {s:?}: {e}"))?;
    let m: u32 = parts
        .next()
        .ok_or_else(|| eyre::eyre!("time of day {s:?} must be HH:MM"))?
        .parse()
        .map_err(|e| eyre::eyre!("invalid minute in {s:?}: {e}"))?;
    if let Some(sec) = parts.next() {
        let sec: u32 = sec
            .parse()
            .map_err(|e| eyre::eyre!("invalid second in {s:?}: {e}"))?;
        if sec >= 60 {
            eyre::bail!("invalid second in {s:?}");
        }
    }
    if parts.next().is_some() || h >= 24 || m >= 60 {
        eyre::bail!("time of day {s:?} out of range");
    }
    Ok(h * 60 + m)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProfileCfg {
    /// Insulin sensitivity factor, mg/dL per unit.
    pub sens: f64,
    /// Grams of carbohydrate covered by one unit.
    pub carb_ratio: f64,
    /// Upper bound on total IOB the loop may build (0 disables extra insulin).
    pub max_iob: f64,
    /// Hard ceiling on any temp basal rate, U/h.
    pub max_basal: f64,
    pub max_daily_safety_multiplier: f64,
    pub current_basal_safety_multiplier: f64,
    /// Pump basal rate resolution, U/h.
    pub basal_increment: f64,
    /// Local time offset used to evaluate the basal schedule.
    pub utc_offset_minutes: i32,
}

impl Default for ProfileCfg {
    fn default() -> Self {
        Self {
            sens: 50.0,
            carb_ratio: 10.0,
            max_iob: 0.0,
            max_basal: 2.0,
            max_daily_safety_multiplier: 3.0,
            current_basal_safety_multiplier: 4.0,
            basal_increment: 0.05,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CurveKind {
    Bilinear,
    #[default]
    RapidActing,
    UltraRapid,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InsulinCfg {
    pub curve: CurveKind,
    /// Duration of insulin action in hours.
    pub dia_hours: f64,
    pub use_custom_peak_time: bool,
    /// Peak activity in minutes; only honored with `use_custom_peak_time`.
    pub insulin_peak_time: u32,
}

impl Default for InsulinCfg {
    fn default() -> Self {
        Self {
            curve: CurveKind::RapidActing,
            dia_hours: 6.0,
            use_custom_peak_time: false,
            insulin_peak_time: 75,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BasalCfg {
    /// Inline schedule; may be replaced by a CSV file at load time.
    pub schedule: Vec<BasalRow>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TargetsCfg {
    pub min_bg: f64,
    pub max_bg: f64,
}

impl Default for TargetsCfg {
    fn default() -> Self {
        Self {
            min_bg: 100.0,
            max_bg: 100.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SafetyCfg {
    /// Glucose older than this (minutes) triggers the fail-safe.
    pub max_glucose_age_min: f64,
    /// Last successful pump read older than this (minutes) triggers the fail-safe.
    pub max_pump_age_min: f64,
    /// Reservoir at or below this many units triggers the fail-safe.
    pub min_reservoir_units: f64,
    /// Optional fixed low-glucose suspend threshold (mg/dL). When absent it
    /// is derived from the target: `min_bg - 0.5 * (min_bg - 40)`.
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

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityMode {
    Off,
    #[default]
    Autosens,
    DynamicIsf,
    Autotuned,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensitivityCfg {
    pub mode: SensitivityMode,
    pub autosens_min: f64,
    pub autosens_max: f64,
    pub resistance_lowers_target: bool,
    pub sensitivity_raises_target: bool,
    pub exercise_mode: bool,
    pub high_temptarget_raises_sensitivity: bool,
    pub low_temptarget_lowers_sensitivity: bool,
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DynamicIsfCfg {
    pub sigmoid: bool,
    pub adjustment_factor: f64,
    pub adjustment_factor_sigmoid: f64,
    /// Share of the 2h-extrapolated TDD in the weighted average, (0, 1].
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SmbCfg {
    pub enable_always: bool,
    pub enable_with_cob: bool,
    pub allow_with_high_temptarget: bool,
    pub max_smb_basal_minutes: u32,
    pub max_uam_smb_basal_minutes: u32,
    /// Minimum minutes between micro-boluses.
    pub smb_interval_min: u32,
    /// Fraction of the insulin requirement delivered per micro-bolus.
    pub smb_delivery_ratio: f64,
    /// Pump bolus resolution, units.
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CarbsCfg {
    /// Minimum assumed carb impact, mg/dL per 5 minutes.
    pub min_5m_carbimpact: f64,
    pub max_cob: f64,
    pub default_absorption_hours: f64,
    /// Peak absorption as a multiple of the entry's average rate.
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReconcileCfg {
    /// Maximum |pump time - command time| for an event to match a dose.
    pub match_window_secs: u64,
    /// Minutes past a dose's expected end before it becomes uncertain.
    pub uncertainty_window_min: u64,
    /// How long reconciled mappings are retained.
    pub mapping_retention_hours: u64,
    /// 20 or 40 pulses per unit, depending on pump generation.
    pub pulses_per_unit: u32,
    /// Pump supports variable bolus delivery rates.
    pub variable_bolus_rate: bool,
}

impl Default for ReconcileCfg {
    fn default() -> Self {
        Self {
            match_window_secs: 60,
            uncertainty_window_min: 10,
            mapping_retention_hours: 12,
            pulses_per_unit: 40,
            variable_bolus_rate: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub profile: ProfileCfg,
    #[serde(default)]
    pub insulin: InsulinCfg,
    #[serde(default)]
    pub basal: BasalCfg,
    #[serde(default)]
    pub targets: TargetsCfg,
    #[serde(default)]
    pub safety: SafetyCfg,
    #[serde(default)]
    pub sensitivity: SensitivityCfg,
    #[serde(default)]
    pub dynamic_isf: DynamicIsfCfg,
    #[serde(default)]
    pub smb: SmbCfg,
    #[serde(default)]
    pub carbs: CarbsCfg,
    #[serde(default)]
    pub reconcile: ReconcileCfg,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

pub fn load_basal_csv(path: &std::path::Path) -> eyre::Result<Vec<BasalRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open basal CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["start", "rate"];
    let actual: Vec<String> = headers.iter().map(ToString::to_string).collect();
    if actual != expected {
        eyre::bail!(
            "basal CSV must have headers 'start,rate', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<BasalRow>().enumerate() {
        match rec {
            Ok(row) => {
                if let Err(e) = row.minutes() {
                    eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
                }
                rows.push(row);
            }
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }
    if rows.is_empty() {
        eyre::bail!("basal CSV {:?} has no rows", path);
    }
    Ok(rows)
}

const INCREMENTS: [f64; 3] = [0.025, 0.05, 0.1];

fn is_known_increment(x: f64) -> bool {
    INCREMENTS.iter().any(|i| (i - x).abs() < 1e-9)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Profile
        let p = &self.profile;
        if !(p.sens.is_finite() && p.sens > 0.0) {
            eyre::bail!("profile.sens must be > 0");
        }
        if !(p.carb_ratio.is_finite() && p.carb_ratio > 0.1) {
            eyre::bail!("profile.carb_ratio must be > 0.1");
        }
        if !(p.max_iob.is_finite() && p.max_iob >= 0.0) {
            eyre::bail!("profile.max_iob must be >= 0");
        }
        if !(p.max_basal.is_finite() && p.max_basal > 0.0) {
            eyre::bail!("profile.max_basal must be > 0");
        }
        if p.max_daily_safety_multiplier <= 0.0 || p.current_basal_safety_multiplier <= 0.0 {
            eyre::bail!("profile safety multipliers must be > 0");
        }
        if !is_known_increment(p.basal_increment) {
            eyre::bail!("profile.basal_increment must be one of 0.025, 0.05, 0.1");
        }
        if p.utc_offset_minutes.abs() > 14 * 60 {
            eyre::bail!("profile.utc_offset_minutes must be within +/-14h");
        }

        // Basal schedule
        if self.basal.schedule.is_empty() {
            eyre::bail!("basal.schedule must have at least one entry");
        }
        let mut prev: Option<u32> = None;
        for (i, row) in self.basal.schedule.iter().enumerate() {
            let m = row
                .minutes()
                .map_err(|e| eyre::eyre!("basal.schedule[{i}].start: {e}"))?;
            if i == 0 && m != 0 {
                eyre::bail!("basal.schedule must start at 00:00");
            }
            if let Some(pm) = prev
                && m <= pm
            {
                eyre::bail!("basal.schedule entries must be strictly increasing by start");
            }
            if !(row.rate.is_finite() && row.rate >= 0.0) {
                eyre::bail!("basal.schedule[{i}].rate must be >= 0");
            }
            if row.rate > p.max_basal {
                eyre::bail!("basal.schedule[{i}].rate must be <= profile.max_basal");
            }
            prev = Some(m);
        }

        // Insulin curve
        let ins = &self.insulin;
        match ins.curve {
            CurveKind::Bilinear => {
                if !(ins.dia_hours.is_finite() && ins.dia_hours >= 3.0) {
                    eyre::bail!("insulin.dia_hours must be >= 3 for the bilinear curve");
                }
            }
            CurveKind::RapidActing | CurveKind::UltraRapid => {
                if !(ins.dia_hours.is_finite() && ins.dia_hours >= 5.0) {
                    eyre::bail!("insulin.dia_hours must be >= 5 for exponential curves");
                }
            }
        }
        if ins.dia_hours > 24.0 {
            eyre::bail!("insulin.dia_hours is unreasonably large (>24h)");
        }
        if ins.use_custom_peak_time {
            let (lo, hi) = match ins.curve {
                CurveKind::UltraRapid => (35, 100),
                _ => (50, 120),
            };
            if !(lo..=hi).contains(&ins.insulin_peak_time) {
                eyre::bail!("insulin.insulin_peak_time must be in [{lo}, {hi}] for this curve");
            }
        }

        // Targets
        let t = &self.targets;
        if !(t.min_bg >= 80.0 && t.min_bg <= 200.0) {
            eyre::bail!("targets.min_bg must be in [80, 200]");
        }
        if t.max_bg < t.min_bg {
            eyre::bail!("targets.max_bg must be >= targets.min_bg");
        }

        // Safety
        let s = &self.safety;
        if s.max_glucose_age_min <= 0.0 {
            eyre::bail!("safety.max_glucose_age_min must be > 0");
        }
        if s.max_pump_age_min <= 0.0 {
            eyre::bail!("safety.max_pump_age_min must be > 0");
        }
        if s.min_reservoir_units < 0.0 {
            eyre::bail!("safety.min_reservoir_units must be >= 0");
        }
        if let Some(th) = s.low_glucose_suspend
            && !(60.0..=120.0).contains(&th)
        {
            eyre::bail!("safety.low_glucose_suspend must be in [60, 120]");
        }

        // Sensitivity
        let sn = &self.sensitivity;
        if !(sn.autosens_min > 0.0 && sn.autosens_min <= 1.0) {
            eyre::bail!("sensitivity.autosens_min must be in (0, 1]");
        }
        if !(sn.autosens_max >= 1.0 && sn.autosens_max <= 3.0) {
            eyre::bail!("sensitivity.autosens_max must be in [1, 3]");
        }
        if sn.half_basal_exercise_target <= 100.0 {
            eyre::bail!("sensitivity.half_basal_exercise_target must be > 100");
        }

        // Dynamic ISF
        let d = &self.dynamic_isf;
        if !(d.adjustment_factor > 0.0 && d.adjustment_factor <= 3.0) {
            eyre::bail!("dynamic_isf.adjustment_factor must be in (0, 3]");
        }
        if !(d.adjustment_factor_sigmoid > 0.0 && d.adjustment_factor_sigmoid <= 3.0) {
            eyre::bail!("dynamic_isf.adjustment_factor_sigmoid must be in (0, 3]");
        }
        if !(0.0..=1.0).contains(&d.weight_percentage) {
            eyre::bail!("dynamic_isf.weight_percentage must be in [0, 1]");
        }

        // SMB
        let b = &self.smb;
        if !is_known_increment(b.bolus_increment) {
            eyre::bail!("smb.bolus_increment must be one of 0.025, 0.05, 0.1");
        }
        if b.max_smb_basal_minutes == 0 || b.max_smb_basal_minutes > 120 {
            eyre::bail!("smb.max_smb_basal_minutes must be in [1, 120]");
        }
        if b.max_uam_smb_basal_minutes == 0 || b.max_uam_smb_basal_minutes > 120 {
            eyre::bail!("smb.max_uam_smb_basal_minutes must be in [1, 120]");
        }
        if !(b.smb_delivery_ratio > 0.0 && b.smb_delivery_ratio <= 1.0) {
            eyre::bail!("smb.smb_delivery_ratio must be in (0, 1]");
        }

        // Carbs
        let c = &self.carbs;
        if c.min_5m_carbimpact < 0.0 {
            eyre::bail!("carbs.min_5m_carbimpact must be >= 0");
        }
        if c.max_cob <= 0.0 {
            eyre::bail!("carbs.max_cob must be > 0");
        }
        if !(c.default_absorption_hours > 0.0 && c.default_absorption_hours <= 12.0) {
            eyre::bail!("carbs.default_absorption_hours must be in (0, 12]");
        }
        if c.max_absorption_factor < 1.0 {
            eyre::bail!("carbs.max_absorption_factor must be >= 1");
        }

        // Reconcile
        let r = &self.reconcile;
        if r.match_window_secs == 0 {
            eyre::bail!("reconcile.match_window_secs must be >= 1");
        }
        if r.uncertainty_window_min == 0 {
            eyre::bail!("reconcile.uncertainty_window_min must be >= 1");
        }
        if r.mapping_retention_hours == 0 {
            eyre::bail!("reconcile.mapping_retention_hours must be >= 1");
        }
        if r.pulses_per_unit != 20 && r.pulses_per_unit != 40 {
            eyre::bail!("reconcile.pulses_per_unit must be 20 or 40");
        }

        Ok(())
    }
}
