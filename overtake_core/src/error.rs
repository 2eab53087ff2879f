//! Error types for the overtaking protocol engine.
//!
//! Protocol outcomes (a neighbor rejecting, a timeout, an abort) are not
//! errors; they are recorded as [`Outcome`](crate::Outcome) values. The
//! types here only cover setup failures and precondition violations at the
//! coordinator boundary.

use crate::attempt::AttemptId;
use crate::platoon::PlatoonId;
use overtake_env::{EnvError, LaneIndex, VehicleId};
use thiserror::Error;

/// Invalid protocol configuration. Fatal at setup.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Config parse error: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Creates an invalid-value error for `field`.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// A request the coordinator refused without mutating any state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("Platoon {platoon} already has active attempt {attempt}")]
    AttemptAlreadyActive { platoon: PlatoonId, attempt: AttemptId },

    #[error("Unknown platoon: {0}")]
    UnknownPlatoon(PlatoonId),

    #[error("A platoon needs at least one vehicle")]
    PlatoonTooSmall,

    #[error("No overtaking lane left of lane {lane}")]
    NoOvertakingLane { lane: LaneIndex },

    #[error("Platoon {0} membership is locked by an active maneuver")]
    MembershipLocked(PlatoonId),

    #[error("Vehicle {0} is already a participant")]
    AlreadyParticipant(VehicleId),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
