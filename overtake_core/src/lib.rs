//! Overtake Core - Cooperative Platoon Overtaking Protocol
//!
//! A leader-coordinated protocol that lets a platoon pass a slower vehicle
//! on a multi-lane freeway:
//! 1. **Decision**: the leader asks followers and nearby cooperative
//!    vehicles for consent over a lossy, delayed V2V channel
//! 2. **Lane change**: members move one at a time, leader first, into the
//!    faster lane and back once the slower vehicle is passed
//! 3. **Safety**: every step is guarded by safety-distance areas and a hard
//!    overtaking time cap
//!
//! Physics live behind [`overtake_env::TrafficEnvironment`]; the engine is
//! fully deterministic for a given channel seed.

pub mod attempt;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod error;
pub mod lane_change;
pub mod message;
pub mod participant;
pub mod platoon;
pub mod safety;

// Re-export key types for convenience
pub use attempt::{AttemptId, AttemptRecord, OvertakingAttempt, Outcome, Phase};
pub use channel::{Channel, ChannelStats, ReliableChannel, SendReceipt, SimChannel};
pub use config::{DelayDistribution, OvertakingConfig};
pub use coordinator::OvertakingCoordinator;
pub use decision::{assess_trigger, DecisionFsm, DecisionState, HoldReason, RejectionReason, TriggerAssessment};
pub use error::{ConfigError, CoordinatorError};
pub use lane_change::{LaneChangeFsm, LaneChangeState, ManeuverContext};
pub use message::{AbortReason, Message, MessageId, Payload, Recipient, RejectCause, Step};
pub use participant::{Participant, ParticipantState, ResponsePolicy};
pub use platoon::{Platoon, PlatoonId, PlatoonSpec, Role, Vehicle};
pub use safety::AreaStatus;
