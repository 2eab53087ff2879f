//! V2V message model.

use crate::attempt::AttemptId;
use overtake_env::{Direction, LaneIndex, VehicleId};
use serde::{Deserialize, Serialize};

/// Discrete simulation step.
pub type Step = u64;

/// Unique id of a message, assigned by the channel in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

/// Receiver of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Vehicle(VehicleId),
    Broadcast,
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Vehicle(id) => write!(f, "{}", id),
            Recipient::Broadcast => write!(f, "*"),
        }
    }
}

/// Why a participant declined an overtaking request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCause {
    /// Already engaged in another leader's maneuver
    Busy,
    /// Own front area toward the target lane is occupied
    FrontAreaOccupied,
    /// Own rear area toward the target lane is occupied
    RearAreaOccupied,
    /// The platoon would cut in too close in front of the responder
    CutIn,
    /// Non-cooperative vehicle
    Declined,
}

/// Why a lane-change phase was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Total attempt time reached the overtaking time cap
    TimeExceeded,
    /// A participant asked the leader to abort
    Requested,
    /// A required area in the target lane is occupied
    AreaOccupied,
    /// The slower vehicle disappeared from the leader's radar
    ObstacleLost,
    /// The environment refused a command or lost a member
    EnvironmentFault,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AbortReason::TimeExceeded => "time_exceeded",
            AbortReason::Requested => "requested",
            AbortReason::AreaOccupied => "area_occupied",
            AbortReason::ObstacleLost => "obstacle_lost",
            AbortReason::EnvironmentFault => "environment_fault",
        };
        write!(f, "{}", name)
    }
}

/// Message content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    RequestOvertake { direction: Direction, target_lane: LaneIndex },
    Ack,
    Reject { cause: RejectCause },
    LaneChangeNotify { target_lane: LaneIndex },
    Abort { reason: AbortReason },
    Complete,
}

impl Payload {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::RequestOvertake { .. } => "RequestOvertake",
            Payload::Ack => "Ack",
            Payload::Reject { .. } => "Reject",
            Payload::LaneChangeNotify { .. } => "LaneChangeNotify",
            Payload::Abort { .. } => "Abort",
            Payload::Complete => "Complete",
        }
    }
}

/// A V2V message. Immutable once the channel has scheduled it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Channel-assigned id (send order)
    pub id: MessageId,

    /// Sending vehicle
    pub from: VehicleId,

    /// Receiving vehicle or broadcast
    pub to: Recipient,

    /// Attempt this message belongs to
    pub attempt: AttemptId,

    /// Content
    pub payload: Payload,

    /// Step the message was sent
    pub created_at: Step,

    /// Earliest step the message may be delivered
    pub deliver_at: Step,
}
