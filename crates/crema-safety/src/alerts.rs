//! Safety alert types and severity levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crema_types::ClampEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SafetySeverity {
    Info,
    /// A proposal was altered or a risky region was found.
    Warning,
    /// A flagged region was deliberately entered.
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyAlertKind {
    /// Repeated failures formed a region future proposals must avoid.
    RegionFlagged {
        centre: Vec<f64>,
        radius: f64,
        trials: Vec<u64>,
    },
    /// A proposal inside a flagged region was let through by the override.
    OverrideUsed { trials: Vec<u64> },
    /// Out-of-range values were moved to the nearest legal setting.
    ClampApplied { adjustments: Vec<ClampEvent> },
}

/// A single alert emitted by the [`SafetyGuard`](crate::SafetyGuard).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAlert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: SafetySeverity,
    pub kind: SafetyAlertKind,
    pub message: String,
    pub acknowledged: bool,
}

impl SafetyAlert {
    pub fn new(severity: SafetySeverity, kind: SafetyAlertKind, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            kind,
            message,
            acknowledged: false,
        }
    }

    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }
}
