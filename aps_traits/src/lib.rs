//! Shared seams between the decision core and its callers.
//!
//! The core never reads the wall clock directly; every cycle and every ledger
//! operation is evaluated against a `Clock` so that replays and tests are
//! deterministic.
pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};
