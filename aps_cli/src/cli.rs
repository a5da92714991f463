//! CLI argument definitions and shared statics.

use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;
use uuid::Uuid;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "aps", version, about = "Automated insulin delivery decision core")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/aps_config.toml")]
    pub config: PathBuf,

    /// Basal schedule CSV (strict `start,rate` header); replaces [basal].schedule
    #[arg(long = "basal-csv", value_name = "FILE")]
    pub basal_csv: Option<PathBuf>,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Evaluate as of this instant (RFC 3339) instead of the wall clock
    #[arg(long, value_name = "TIME", global = true)]
    pub now: Option<DateTime<Utc>>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Inputs shared by every command that models insulin on board.
#[derive(clap::Args, Debug, Clone)]
pub struct DataArgs {
    /// Glucose readings, JSON array
    #[arg(long, value_name = "FILE")]
    pub glucose: Option<PathBuf>,
    /// Pump history events, JSON array
    #[arg(long, value_name = "FILE")]
    pub history: Option<PathBuf>,
    /// Pending-dose ledger, JSON
    #[arg(long, value_name = "FILE")]
    pub ledger: Option<PathBuf>,
    /// Carb entries, JSON array
    #[arg(long, value_name = "FILE")]
    pub carbs: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Outcome {
    Delivered,
    NotDelivered,
    Partial,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum DoseArg {
    Bolus,
    TempBasal,
    Suspend,
    Resume,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one control cycle and print the suggestion
    Suggest {
        #[command(flatten)]
        data: DataArgs,
        /// Rate of the running temp basal, U/h
        #[arg(long, value_name = "U/H", requires = "temp_minutes")]
        temp_rate: Option<f64>,
        /// Minutes left on the running temp basal
        #[arg(long, value_name = "MIN")]
        temp_minutes: Option<f64>,
        /// Units left in the reservoir
        #[arg(long, value_name = "UNITS")]
        reservoir: Option<f64>,
        /// When pump history was last read (defaults to the newest history event or ledger dose)
        #[arg(long, value_name = "TIME")]
        pump_updated_at: Option<DateTime<Utc>>,
        /// Start of available pump history, for TDD coverage
        #[arg(long, value_name = "TIME")]
        history_start: Option<DateTime<Utc>>,
        /// Allow micro-boluses this cycle
        #[arg(long, action = ArgAction::SetTrue)]
        microbolus: bool,
        /// Profile override, JSON
        #[arg(long = "override", value_name = "FILE")]
        profile_override: Option<PathBuf>,
        /// Temp target as LOW-HIGH mg/dL, e.g. 140-160
        #[arg(long, value_name = "LOW-HIGH")]
        temp_target: Option<String>,
        /// Run the TDD-ratio middleware on the profile
        #[arg(long, action = ArgAction::SetTrue)]
        tdd_middleware: bool,
        /// Also write the suggestion here (atomically)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Add a commanded dose to the ledger
    Record {
        #[arg(long, value_name = "FILE")]
        ledger: PathBuf,
        #[arg(long, value_enum)]
        kind: DoseArg,
        /// Bolus units
        #[arg(long, value_name = "UNITS")]
        units: Option<f64>,
        /// Temp basal rate, U/h
        #[arg(long, value_name = "U/H")]
        rate: Option<f64>,
        /// Temp basal duration
        #[arg(long, value_name = "MIN", default_value_t = 30)]
        minutes: u32,
        /// Command time (defaults to now)
        #[arg(long, value_name = "TIME")]
        at: Option<DateTime<Utc>>,
        /// Mark as manual rather than automatic
        #[arg(long, action = ArgAction::SetTrue)]
        manual: bool,
    },
    /// Match pump history against the ledger and write it back
    Reconcile {
        #[arg(long, value_name = "FILE")]
        ledger: PathBuf,
        #[arg(long, value_name = "FILE")]
        history: PathBuf,
        /// Move reconciled, finished doses out of the ledger into the report
        #[arg(long, action = ArgAction::SetTrue)]
        drain: bool,
    },
    /// Settle an uncertain dose
    Resolve {
        #[arg(long, value_name = "FILE")]
        ledger: PathBuf,
        #[arg(long)]
        uuid: Uuid,
        #[arg(long, value_enum)]
        outcome: Outcome,
        /// Units delivered, for --outcome partial
        #[arg(long, value_name = "UNITS", required_if_eq("outcome", "partial"))]
        units: Option<f64>,
    },
    /// Detect sensitivity from the last 24 h of data
    Autosens {
        #[command(flatten)]
        data: DataArgs,
    },
    /// Total daily dose from pump history
    Tdd {
        #[command(flatten)]
        data: DataArgs,
        /// Start of available pump history
        #[arg(long, value_name = "TIME")]
        history_start: Option<DateTime<Utc>>,
    },
    /// Tune basal, ISF and carb ratio against past days
    Autotune {
        #[command(flatten)]
        data: DataArgs,
    },
    /// Validate the configuration and print the effective profile
    SelfCheck,
}
