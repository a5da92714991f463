#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
// Clinical math mixes integer timestamps, pulse counts and f64 units throughout.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::float_cmp,
    clippy::suboptimal_flops,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::doc_markdown,
    clippy::too_many_lines,
    clippy::missing_const_for_fn,
    clippy::similar_names,
    clippy::struct_excessive_bools,
    clippy::option_if_let_else
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Decision core of an automated insulin delivery controller (pump-agnostic).
//!
//! Every entry point is a function of explicit inputs: glucose history, pump
//! history, the pending-dose ledger, carbs, a profile and a clock. Nothing in
//! this crate talks to a pump, a sensor or the network; the CLI and any future
//! device layer feed it data and act on the returned [`Suggestion`].
//!
//! ## Architecture
//!
//! - **Configuration**: runtime profile and tuning structs (`config`), built from
//!   `aps_config` TOML via `conversions`
//! - **History**: pump events plus the pending ledger merged into a dose timeline (`history`)
//! - **Insulin on board**: activity curves and IOB trajectories (`iob`)
//! - **Glucose / carbs**: deltas and noise handling (`glucose`), carbs on board (`cob`)
//! - **Sensitivity**: autosens, TDD, dynamic ISF and autotune (`sensitivity`),
//!   profile overrides and temp targets (`overrides`), sandboxed middleware (`middleware`)
//! - **Decision**: temp basal / SMB recommendation with fail-safes (`determine_basal`)
//! - **Reconciliation**: matching pending doses against pump history (`reconcile`),
//!   delivery estimates (`pump`), the single-writer worker (`ledger`)
//! - **Pipeline**: one full control cycle behind a type-state builder (`pipeline`)
//!
//! ## Fixed-Point Comparisons
//!
//! Dose amounts are compared in integer milli-units (`fixed_point::units_to_milli`)
//! so that history replays match the ledger exactly.

pub mod cob;
pub mod config;
pub mod conversions;
pub mod determine_basal;
pub mod error;
pub mod fixed_point;
pub mod glucose;
pub mod history;
pub mod iob;
pub mod ledger;
pub mod middleware;
pub mod mocks;
pub mod overrides;
pub mod pipeline;
pub mod pump;
pub mod reconcile;
pub mod sensitivity;
pub mod status;
pub mod suggestion;
pub mod types;
pub mod util;

pub use config::{Profile, ReconcileCfg};
pub use determine_basal::{DecisionInputs, determine_basal};
pub use error::{ApsError, BuildError, Report, Result};
pub use ledger::LedgerWorker;
pub use middleware::{ProfileMiddleware, TddRatioMiddleware};
pub use pipeline::{CycleInputs, CycleOutput, run_cycle};
pub use reconcile::{PendingLedger, ReconcileOutcome, ReconcileReport, Resolution, reconcile};
pub use status::DoseState;
pub use suggestion::Suggestion;
pub use types::{
    CarbEntry, CurrentTemp, DoseKind, EventKind, EventRaw, GlucoseSample, PumpHistoryEvent,
    UnfinalizedDose,
};
