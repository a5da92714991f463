//! Reconciliation state of a pending dose.

use serde::{Deserialize, Serialize};

/// Lifecycle of a commanded dose against pump history.
///
/// `Pending -> Reconciled` is the normal path. `Pending -> Uncertain` happens
/// when no confirming event arrives within the uncertainty window; an
/// uncertain dose only leaves that state through a later matching event or an
/// explicit recovery decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseState {
    #[default]
    Pending,
    Reconciled,
    Uncertain,
}

impl DoseState {
    /// Whether a pump event may still be matched to a dose in this state.
    #[inline]
    pub fn is_matchable(self) -> bool {
        matches!(self, Self::Pending | Self::Uncertain)
    }
}
