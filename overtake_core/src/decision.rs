//! Decision phase: trigger assessment and the negotiation state machine.
//!
//! ```text
//! Idle --trigger--> Triggered --requests sent--> AwaitingResponses
//!                                                  |-- all Ack ----> Approved
//!                                                  |-- any Reject -> Rejected
//!                                                  '-- timeout ----> Rejected
//! ```

use crate::attempt::AttemptId;
use crate::channel::Channel;
use crate::config::OvertakingConfig;
use crate::message::{Message, Payload, Recipient, RejectCause, Step};
use crate::platoon::Platoon;
use crate::safety::{front_area, overtaking_time, rear_area, safety_dist_platoon, PassingInput};
use overtake_env::{Direction, LaneIndex, Neighbor, Side, TrafficEnvironment, VehicleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// States of the decision phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionState {
    Idle,
    Triggered,
    AwaitingResponses,
    Approved,
    Rejected,
}

impl DecisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecisionState::Approved | DecisionState::Rejected)
    }
}

/// Why a decision phase ended in `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// A responder declined
    Declined { by: VehicleId, cause: RejectCause },
    /// Not every responder answered within the decision timeout
    Timeout,
}

/// Decision-phase state machine of one attempt.
#[derive(Debug, Clone)]
pub struct DecisionFsm {
    state: DecisionState,
    triggered_at: Step,
    expected: BTreeSet<VehicleId>,
    acked: BTreeSet<VehicleId>,
    rejection: Option<RejectionReason>,
    visited: Vec<DecisionState>,
}

impl Default for DecisionFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionFsm {
    pub fn new() -> Self {
        Self {
            state: DecisionState::Idle,
            triggered_at: 0,
            expected: BTreeSet::new(),
            acked: BTreeSet::new(),
            rejection: None,
            visited: vec![DecisionState::Idle],
        }
    }

    pub fn state(&self) -> DecisionState {
        self.state
    }

    pub fn triggered_at(&self) -> Step {
        self.triggered_at
    }

    /// Responders that still have to answer.
    pub fn outstanding(&self) -> impl Iterator<Item = &VehicleId> {
        self.expected.difference(&self.acked)
    }

    pub fn rejection(&self) -> Option<RejectionReason> {
        self.rejection
    }

    /// States in the order they were entered.
    pub fn visited(&self) -> &[DecisionState] {
        &self.visited
    }

    fn transition(&mut self, attempt: AttemptId, next: DecisionState) {
        debug!("Attempt {}: decision {:?} -> {:?}", attempt, self.state, next);
        self.state = next;
        self.visited.push(next);
    }

    /// Leaves `Idle`: records the trigger step, sends `RequestOvertake` to
    /// every responder and starts waiting. Approves at once if nobody has
    /// to answer. Does nothing unless `Idle`.
    #[allow(clippy::too_many_arguments)]
    pub fn start<C: Channel + ?Sized>(
        &mut self,
        channel: &mut C,
        attempt: AttemptId,
        leader: VehicleId,
        responders: BTreeSet<VehicleId>,
        target_lane: LaneIndex,
        direction: Direction,
        now: Step,
    ) {
        if self.state != DecisionState::Idle {
            return;
        }
        self.triggered_at = now;
        self.transition(attempt, DecisionState::Triggered);

        for responder in &responders {
            channel.send(
                leader,
                Recipient::Vehicle(*responder),
                attempt,
                Payload::RequestOvertake { direction, target_lane },
                now,
            );
        }
        self.expected = responders;
        self.transition(attempt, DecisionState::AwaitingResponses);

        if self.expected.is_empty() {
            self.transition(attempt, DecisionState::Approved);
        }
    }

    /// Advances the machine by one step with the messages delivered to the
    /// leader. The timeout is checked before any message is consumed.
    pub fn step(&mut self, attempt: AttemptId, now: Step, inbox: &[Message], config: &OvertakingConfig) -> DecisionState {
        if self.state != DecisionState::AwaitingResponses {
            return self.state;
        }

        if now.saturating_sub(self.triggered_at) >= config.decision_timeout_steps {
            debug!(
                "Attempt {}: decision timed out after {} steps, missing {:?}",
                attempt,
                now - self.triggered_at,
                self.outstanding().collect::<Vec<_>>()
            );
            self.rejection = Some(RejectionReason::Timeout);
            self.transition(attempt, DecisionState::Rejected);
            return self.state;
        }

        for message in inbox {
            if message.attempt != attempt || !self.expected.contains(&message.from) {
                trace!("Attempt {}: ignoring {} from {}", attempt, message.payload.kind(), message.from);
                continue;
            }
            match message.payload {
                Payload::Reject { cause } => {
                    debug!("Attempt {}: {} rejected ({:?})", attempt, message.from, cause);
                    self.rejection = Some(RejectionReason::Declined {
                        by: message.from,
                        cause,
                    });
                    self.transition(attempt, DecisionState::Rejected);
                    return self.state;
                }
                Payload::Ack => {
                    self.acked.insert(message.from);
                }
                _ => {}
            }
        }

        if self.acked.len() == self.expected.len() {
            self.transition(attempt, DecisionState::Approved);
        }
        self.state
    }
}

/// Why a platoon does not start an attempt right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HoldReason {
    /// No vehicle ahead in the leader's lane within radar range
    NoVehicleAhead,
    /// Members are not all centered in the platoon's lane
    NotInFormation,
    /// Speed deficit below the threshold
    DeficitBelowThreshold { deficit: f64 },
    /// No lane to the left
    NoOvertakingLane,
    /// Passing would take longer than the overtaking time cap
    TooSlowToPass { predicted: f64 },
    /// The slower vehicle is too far away to matter
    ObstacleTooFar { distance: f64 },
    /// The leader's own areas toward the overtaking lane are occupied
    OwnAreaOccupied,
}

/// Outcome of the trigger assessment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerAssessment {
    Trigger {
        /// Slower vehicle ahead
        obstacle: Neighbor,
        /// Desired speed minus the lower of leader and obstacle speed
        deficit: f64,
        /// Predicted overtaking time (s)
        predicted_time: f64,
        /// Lane to overtake in
        target_lane: LaneIndex,
    },
    Hold(HoldReason),
}

/// Evaluates the trigger condition for an idle platoon.
///
/// The speed rule is "meets or exceeds" the configured delta, without
/// hysteresis.
pub fn assess_trigger<E: TrafficEnvironment + ?Sized>(
    env: &E,
    platoon: &Platoon,
    config: &OvertakingConfig,
) -> TriggerAssessment {
    let leader = &platoon.leader().telemetry;
    if !platoon.all_in_lane(platoon.lane(), config.centering_tolerance) {
        return TriggerAssessment::Hold(HoldReason::NotInFormation);
    }

    let Some(obstacle) = env.nearest(leader.id, Direction::Same, Side::Front, config.detection_range_front) else {
        return TriggerAssessment::Hold(HoldReason::NoVehicleAhead);
    };

    let deficit = platoon.desired_speed() - leader.speed.min(obstacle.speed);
    if deficit < config.min_overtaking_speed_delta {
        return TriggerAssessment::Hold(HoldReason::DeficitBelowThreshold { deficit });
    }

    let Some(target_lane) = Direction::Left.apply(leader.lane, env.lane_count()) else {
        return TriggerAssessment::Hold(HoldReason::NoOvertakingLane);
    };

    let predicted = overtaking_time(
        config,
        &PassingInput {
            platoon_speed: leader.speed,
            slower_speed: obstacle.speed,
            distance: obstacle.distance,
            max_accel: leader.max_accel,
            lane_speed_cap: platoon.desired_speed().min(env.lane_speed_limit(target_lane)),
            platoon_length: platoon.length(),
            lateral_speed: leader.max_lateral_speed,
        },
    );
    if predicted > config.max_overtaking_time {
        return TriggerAssessment::Hold(HoldReason::TooSlowToPass { predicted });
    }

    let reach = config.factor_safety_distance * safety_dist_platoon(config, leader.headway_time, leader.speed, false);
    if obstacle.distance >= reach {
        return TriggerAssessment::Hold(HoldReason::ObstacleTooFar {
            distance: obstacle.distance,
        });
    }

    let members = platoon.member_ids();
    let last = &platoon.last().telemetry;
    if !front_area(env, config, leader, Direction::Left, false, &members).is_free()
        || !rear_area(env, config, last, Direction::Left, false, &members).is_free()
    {
        return TriggerAssessment::Hold(HoldReason::OwnAreaOccupied);
    }

    TriggerAssessment::Trigger {
        obstacle,
        deficit,
        predicted_time: predicted,
        target_lane,
    }
}
