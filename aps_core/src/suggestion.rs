//! The decision engine's output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Temp basal to enact. A zero rate with zero duration cancels the running temp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempBasal {
    /// U/h
    pub rate: f64,
    /// Minutes
    pub duration: u32,
}

impl TempBasal {
    pub const CANCEL: Self = Self {
        rate: 0.0,
        duration: 0,
    };

    pub fn is_cancel(&self) -> bool {
        self.duration == 0
    }
}

/// Predicted glucose curves, one value per 5 minutes starting now.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    pub iob: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cob: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// `None` leaves the running temp unchanged.
    pub temp: Option<TempBasal>,
    /// Micro-bolus to deliver.
    pub units: Option<f64>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub deliver_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventual_bg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pred_bg: Option<f64>,
    pub iob: f64,
    pub cob: f64,
    pub sensitivity_ratio: f64,
    pub insulin_req: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_bg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isf: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Predictions>,
    /// Inputs were unusable; the temp is a cancel and nothing else is enacted.
    #[serde(default)]
    pub fail_safe: bool,
}

impl Suggestion {
    /// Cancel any temp, deliver nothing.
    pub fn fail_safe(now: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            temp: Some(TempBasal::CANCEL),
            units: None,
            reason: reason.into(),
            timestamp: now,
            deliver_at: now,
            bg: None,
            eventual_bg: None,
            min_pred_bg: None,
            iob: 0.0,
            cob: 0.0,
            sensitivity_ratio: 1.0,
            insulin_req: 0.0,
            target_bg: None,
            isf: None,
            carb_ratio: None,
            predictions: None,
            fail_safe: true,
        }
    }
}
