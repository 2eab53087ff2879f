//! Error types for the traffic environment abstraction.

use crate::types::{LaneIndex, VehicleId};
use thiserror::Error;

/// Errors that can occur when talking to the traffic environment.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// The vehicle is not (or no longer) part of the environment
    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(VehicleId),

    /// A lane index outside the road was requested
    #[error("Lane {lane} out of range (road has {lanes} lanes)")]
    LaneOutOfRange { lane: LaneIndex, lanes: u8 },

    /// The environment refused to insert a vehicle
    #[error("Spawn rejected: {0}")]
    SpawnRejected(String),

    /// The environment refused an actuation command
    #[error("Command rejected: {0}")]
    CommandRejected(String),
}

impl EnvError {
    /// Creates a spawn rejection.
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::SpawnRejected(msg.into())
    }

    /// Creates a command rejection.
    pub fn command(msg: impl Into<String>) -> Self {
        Self::CommandRejected(msg.into())
    }
}
