//! Failure policies for multi-unit experiments.
//!
//! This module defines the [`FailurePolicy`] enum which controls what the
//! orchestrator does once a unit reaches the failed state. Units are always
//! provisioned one at a time; the policy only decides whether the remaining
//! units still get their turn.

use serde::{Deserialize, Serialize};

/// What to do with an experiment after one of its units fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep going with the next unit.
    ///
    /// Resources already created for the failed unit are left in place and
    /// the experiment is marked failed. The remaining units are still
    /// provisioned, so operators can inspect a partially working experiment.
    ///
    /// **Use when:** existing operational behaviour must be preserved.
    #[default]
    Continue,

    /// Roll back the failed unit and stop.
    ///
    /// Every resource the failed unit created is deleted in reverse creation
    /// order, no further units are provisioned and the experiment ends up
    /// rolled back.
    ///
    /// **Use when:** leaked cloud resources cost more than a retry.
    Abort,
}

impl FailurePolicy {
    /// Get the policy name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
        }
    }

    /// Whether compensating deletes run for a failed unit.
    #[must_use]
    pub const fn rolls_back(&self) -> bool {
        matches!(self, Self::Abort)
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_is_continue() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Continue);
        assert!(!FailurePolicy::default().rolls_back());
    }

    #[test]
    fn serde_from_string() {
        let cont: FailurePolicy = serde_json::from_str(r#""continue""#).unwrap();
        assert_eq!(cont, FailurePolicy::Continue);

        let abort: FailurePolicy = serde_json::from_str(r#""abort""#).unwrap();
        assert_eq!(abort, FailurePolicy::Abort);
        assert!(abort.rolls_back());
    }
}
