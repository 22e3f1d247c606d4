//! Cycle states and outcomes

use serde::Serialize;
use std::fmt;

use crate::models::ChangeId;

/// Where a polling cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    #[default]
    Idle,
    Acquiring,
    Reading,
    Delivering,
    Notifying,
    Committing,
    Releasing,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Reading => "reading",
            Self::Delivering => "delivering",
            Self::Notifying => "notifying",
            Self::Committing => "committing",
            Self::Releasing => "releasing",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a polling cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another replica holds the lease; nothing was read
    LeaseHeld,

    /// Lease held, no changes past the checkpoint
    Empty,

    /// Batch accepted downstream and checkpoint advanced
    Delivered {
        count: usize,
        checkpoint: ChangeId,
        webhooks_failed: usize,
    },

    /// Primary delivery failed; checkpoint unchanged
    DeliveryFailed { count: usize, error: String },

    /// Store failure or panic ended the cycle early
    Aborted { error: String },
}

impl CycleOutcome {
    pub fn delivered_count(&self) -> usize {
        match self {
            Self::Delivered { count, .. } => *count,
            _ => 0,
        }
    }
}
