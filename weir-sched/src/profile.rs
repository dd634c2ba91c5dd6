//! Built-in QoS profiles.
//!
//! A profile is a coarse operator knob that expands into the per-class
//! `(reservation_ratio, weight, limit_ratio)` triples consumed by the client
//! registry. Every shard materializes the active profile locally from the
//! same constants, so all shards of a node converge without any shared
//! mutable state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use weir_core::WeirError;

use crate::config::{ClassQos, QosSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Client: 60% reservation, weight 2, no cap.
    /// Recovery: 40% reservation, weight 1, no cap.
    /// Best-effort: no reservation, weight 1, capped at 70%.
    HighClientOps,
    /// Client: 30% reservation, weight 1, no cap.
    /// Recovery: 70% reservation, weight 2, no cap.
    /// Best-effort: no reservation, weight 1, no cap.
    HighRecoveryOps,
    /// Client and recovery split 50/50 at weight 1, no caps.
    /// Best-effort: no reservation, weight 1, capped at 90%.
    #[default]
    Balanced,
    /// Profile application is suppressed; the operator's explicit per-class
    /// settings are used as-is.
    Custom,
}

impl Profile {
    /// The per-class allocation triples this profile expands to, or `None`
    /// for [`Profile::Custom`].
    ///
    /// A ratio of `0.0` means "no minimum" (reservation) or "no ceiling"
    /// (limit); the registry resolves those to its floor/sentinel rates.
    #[must_use]
    pub fn allocations(self) -> Option<QosSettings> {
        let triple = |reservation_ratio: f64, weight: u64, limit_ratio: f64| ClassQos {
            reservation_ratio,
            weight,
            limit_ratio,
        };
        match self {
            Profile::HighClientOps => Some(QosSettings {
                client: triple(0.6, 2, 0.0),
                background_recovery: triple(0.4, 1, 0.0),
                background_best_effort: triple(0.0, 1, 0.7),
            }),
            Profile::HighRecoveryOps => Some(QosSettings {
                client: triple(0.3, 1, 0.0),
                background_recovery: triple(0.7, 2, 0.0),
                background_best_effort: triple(0.0, 1, 0.0),
            }),
            Profile::Balanced => Some(QosSettings {
                client: triple(0.5, 1, 0.0),
                background_recovery: triple(0.5, 1, 0.0),
                background_best_effort: triple(0.0, 1, 0.9),
            }),
            Profile::Custom => None,
        }
    }

    /// Resolve the effective per-class table: the profile's own allocations,
    /// or the operator's explicit settings under [`Profile::Custom`].
    #[must_use]
    pub fn materialize(self, explicit: &QosSettings) -> QosSettings {
        self.allocations().unwrap_or(*explicit)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::HighClientOps => write!(f, "high_client_ops"),
            Profile::HighRecoveryOps => write!(f, "high_recovery_ops"),
            Profile::Balanced => write!(f, "balanced"),
            Profile::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for Profile {
    type Err = WeirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high_client_ops" => Ok(Profile::HighClientOps),
            "high_recovery_ops" => Ok(Profile::HighRecoveryOps),
            "balanced" => Ok(Profile::Balanced),
            "custom" => Ok(Profile::Custom),
            other => Err(WeirError::Config(format!("unknown QoS profile: {other}"))),
        }
    }
}
