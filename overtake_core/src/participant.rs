//! Responder side of the protocol.
//!
//! Every platoon follower and every registered cooperative neighbor runs a
//! [`Participant`]. It answers overtaking requests according to its
//! [`ResponsePolicy`], follows the engaged leader through the maneuver, and
//! falls back to `Idle` on its own when messages get lost.

use crate::attempt::AttemptId;
use crate::channel::Channel;
use crate::config::OvertakingConfig;
use crate::message::{AbortReason, Message, Payload, Recipient, RejectCause, Step};
use crate::safety::{d_min, front_area, rear_area, AreaStatus};
use overtake_env::{Direction, LaneIndex, Side, TrafficEnvironment, VehicleId};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// How a participant answers `RequestOvertake`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePolicy {
    /// Ack iff own front and rear areas toward the target lane are free
    AssessOwnAreas,
    /// Ack iff the platoon would not cut in inside the own braking envelope
    AssessCutIn,
    AlwaysAck,
    AlwaysReject,
    /// Never answers
    Silent,
}

/// Participant states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    Idle,
    AwaitingDecision,
    InManeuver,
    AbortRequested,
}

/// The maneuver a participant is engaged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Engagement {
    pub leader: VehicleId,
    pub attempt: AttemptId,
    pub direction: Direction,
    pub target_lane: LaneIndex,
    pub since: Step,

    /// Seen settled in the target lane, so the next lane change heads back
    pub returning: bool,
}

/// Responder state machine of one vehicle.
#[derive(Debug, Clone)]
pub struct Participant {
    vehicle: VehicleId,
    policy: ResponsePolicy,
    state: ParticipantState,
    engagement: Option<Engagement>,

    /// Own platoon, excluded from area checks
    platoon: Vec<VehicleId>,
}

impl Participant {
    /// Creates a platoon follower.
    pub fn follower(vehicle: VehicleId, platoon: Vec<VehicleId>) -> Self {
        Self::new(vehicle, ResponsePolicy::AssessOwnAreas, platoon)
    }

    /// Creates an external neighbor.
    pub fn neighbor(vehicle: VehicleId, policy: ResponsePolicy) -> Self {
        Self::new(vehicle, policy, Vec::new())
    }

    fn new(vehicle: VehicleId, policy: ResponsePolicy, platoon: Vec<VehicleId>) -> Self {
        Self {
            vehicle,
            policy,
            state: ParticipantState::Idle,
            engagement: None,
            platoon,
        }
    }

    pub fn vehicle(&self) -> VehicleId {
        self.vehicle
    }

    pub fn policy(&self) -> ResponsePolicy {
        self.policy
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn engagement(&self) -> Option<&Engagement> {
        self.engagement.as_ref()
    }

    fn transition(&mut self, next: ParticipantState) {
        if self.state != next {
            debug!("Participant {}: {:?} -> {:?}", self.vehicle, self.state, next);
            self.state = next;
        }
        if next == ParticipantState::Idle {
            self.engagement = None;
        }
    }

    fn engaged_with(&self, message: &Message) -> bool {
        self.engagement
            .map(|e| e.leader == message.from && e.attempt == message.attempt)
            .unwrap_or(false)
    }

    /// Advances the participant by one step.
    ///
    /// Timeouts are applied first, then the delivered messages in order,
    /// then the in-maneuver self check.
    pub fn step<E, C>(&mut self, env: &E, channel: &mut C, inbox: &[Message], now: Step, config: &OvertakingConfig)
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        self.apply_timeouts(now, config);

        for message in inbox {
            match message.payload {
                Payload::RequestOvertake { direction, target_lane } => {
                    self.on_request(env, channel, message, direction, target_lane, now, config);
                }
                Payload::LaneChangeNotify { .. } if self.engaged_with(message) => {
                    if self.state == ParticipantState::AwaitingDecision {
                        self.transition(ParticipantState::InManeuver);
                    }
                }
                Payload::Abort { .. } | Payload::Complete if self.engaged_with(message) => {
                    self.transition(ParticipantState::Idle);
                }
                _ => {
                    trace!("Participant {}: ignoring {} from {}", self.vehicle, message.payload.kind(), message.from);
                }
            }
        }

        if self.state == ParticipantState::InManeuver && self.policy == ResponsePolicy::AssessOwnAreas {
            self.check_own_lane_change(env, channel, now, config);
        }
    }

    fn apply_timeouts(&mut self, now: Step, config: &OvertakingConfig) {
        let Some(engagement) = self.engagement else {
            return;
        };
        let elapsed = now.saturating_sub(engagement.since);
        let expired = match self.state {
            ParticipantState::AwaitingDecision => elapsed >= config.decision_timeout_steps,
            ParticipantState::InManeuver | ParticipantState::AbortRequested => {
                elapsed >= config.max_overtaking_steps()
            }
            ParticipantState::Idle => false,
        };
        if expired {
            debug!(
                "Participant {}: no word from {} for {} steps, back to idle",
                self.vehicle, engagement.leader, elapsed
            );
            self.transition(ParticipantState::Idle);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request<E, C>(
        &mut self,
        env: &E,
        channel: &mut C,
        message: &Message,
        direction: Direction,
        target_lane: LaneIndex,
        now: Step,
        config: &OvertakingConfig,
    ) where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        let leader = message.from;
        if let Some(engagement) = self.engagement {
            if engagement.leader != leader {
                debug!(
                    "Participant {}: busy with {}, rejecting request from {}",
                    self.vehicle, engagement.leader, leader
                );
                channel.send(
                    self.vehicle,
                    Recipient::Vehicle(leader),
                    message.attempt,
                    Payload::Reject { cause: RejectCause::Busy },
                    now,
                );
                return;
            }
            match message.attempt.cmp(&engagement.attempt) {
                std::cmp::Ordering::Equal => {
                    trace!("Participant {}: duplicate request from {}", self.vehicle, leader);
                    return;
                }
                std::cmp::Ordering::Less => {
                    trace!("Participant {}: stale request {} from {}", self.vehicle, message.attempt, leader);
                    return;
                }
                std::cmp::Ordering::Greater => {
                    // A leader runs one attempt at a time, so the old one is over
                    debug!(
                        "Participant {}: {} superseded by {} from {}",
                        self.vehicle, engagement.attempt, message.attempt, leader
                    );
                    self.transition(ParticipantState::Idle);
                }
            }
        }

        let answer = match self.policy {
            ResponsePolicy::Silent => None,
            ResponsePolicy::AlwaysAck => Some(Payload::Ack),
            ResponsePolicy::AlwaysReject => Some(Payload::Reject {
                cause: RejectCause::Declined,
            }),
            ResponsePolicy::AssessOwnAreas => Some(self.assess_own_areas(env, direction, config)),
            ResponsePolicy::AssessCutIn => Some(self.assess_cut_in(env, direction, target_lane, config)),
        };
        let Some(payload) = answer else {
            trace!("Participant {}: staying silent", self.vehicle);
            return;
        };

        channel.send(self.vehicle, Recipient::Vehicle(leader), message.attempt, payload, now);
        if payload == Payload::Ack {
            self.engagement = Some(Engagement {
                leader,
                attempt: message.attempt,
                direction,
                target_lane,
                since: now,
                returning: false,
            });
            self.transition(ParticipantState::AwaitingDecision);
        } else {
            debug!("Participant {}: {:?} to {}", self.vehicle, payload, leader);
        }
    }

    fn assess_own_areas<E: TrafficEnvironment + ?Sized>(
        &self,
        env: &E,
        direction: Direction,
        config: &OvertakingConfig,
    ) -> Payload {
        let Some(me) = env.telemetry(self.vehicle) else {
            warn!("Participant {}: no telemetry, declining", self.vehicle);
            return Payload::Reject {
                cause: RejectCause::Declined,
            };
        };
        if let AreaStatus::Occupied { culprit, .. } = front_area(env, config, &me, direction, false, &self.platoon) {
            debug!("Participant {}: front area occupied by {}", self.vehicle, culprit);
            return Payload::Reject {
                cause: RejectCause::FrontAreaOccupied,
            };
        }
        if let AreaStatus::Occupied { culprit, .. } = rear_area(env, config, &me, direction, false, &self.platoon) {
            debug!("Participant {}: rear area occupied by {}", self.vehicle, culprit);
            return Payload::Reject {
                cause: RejectCause::RearAreaOccupied,
            };
        }
        Payload::Ack
    }

    /// A target-lane vehicle checks the vehicle that would cut in ahead of it.
    fn assess_cut_in<E: TrafficEnvironment + ?Sized>(
        &self,
        env: &E,
        direction: Direction,
        target_lane: LaneIndex,
        config: &OvertakingConfig,
    ) -> Payload {
        let Some(me) = env.telemetry(self.vehicle) else {
            return Payload::Ack;
        };
        if me.lane != target_lane {
            return Payload::Ack;
        }
        let Some(ahead) = env.nearest(self.vehicle, direction.flip(), Side::Front, config.neighbor_radius) else {
            return Payload::Ack;
        };
        let a = config.max_decel_entering;
        let required = d_min(config, a, ahead.speed, me.speed, direction, false);
        if ahead.distance < required {
            debug!(
                "Participant {}: {} would cut in at {:.1} m (needs {:.1} m)",
                self.vehicle, ahead.id, ahead.distance, required
            );
            Payload::Reject {
                cause: RejectCause::CutIn,
            }
        } else {
            Payload::Ack
        }
    }

    /// A follower whose own lane change is in progress asks the leader to
    /// abort when its rear area fills up.
    fn check_own_lane_change<E, C>(&mut self, env: &E, channel: &mut C, now: Step, config: &OvertakingConfig)
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        let Some(me) = env.telemetry(self.vehicle) else {
            return;
        };
        let Some(engagement) = self.engagement.as_mut() else {
            return;
        };
        if me.is_centered(config.centering_tolerance) {
            if me.lane == engagement.target_lane && !engagement.returning {
                trace!("Participant {}: settled in lane {}", self.vehicle, me.lane);
                engagement.returning = true;
            }
            return;
        }
        let engagement = *engagement;
        let destination = if engagement.returning {
            engagement
                .direction
                .flip()
                .apply(engagement.target_lane, env.lane_count())
                .unwrap_or(engagement.target_lane)
        } else {
            engagement.target_lane
        };
        // Same once the marking is crossed: the rear area is then in the own lane
        let direction = Direction::between(me.lane, destination);
        if let AreaStatus::Occupied { culprit, distance, required } =
            rear_area(env, config, &me, direction, true, &self.platoon)
        {
            debug!(
                "Participant {}: {} at {:.1} m behind (needs {:.1} m), requesting abort",
                self.vehicle, culprit, distance, required
            );
            channel.send(
                self.vehicle,
                Recipient::Vehicle(engagement.leader),
                engagement.attempt,
                Payload::Abort {
                    reason: AbortReason::Requested,
                },
                now,
            );
            self.transition(ParticipantState::AbortRequested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ReliableChannel;
    use crate::message::MessageId;
    use overtake_env::{StubTraffic, VehicleSpawn, VehicleType};

    const A: AttemptId = AttemptId(3);

    fn spawn(env: &mut StubTraffic, lane: u8, position: f64, speed: f64) -> VehicleId {
        env.spawn_vehicle(VehicleSpawn {
            vehicle_type: VehicleType::platoon_car(),
            route: "freeway".to_string(),
            position,
            lane,
            speed,
        })
        .unwrap()
    }

    fn msg(from: VehicleId, to: VehicleId, attempt: AttemptId, payload: Payload) -> Message {
        Message {
            id: MessageId(0),
            from,
            to: Recipient::Vehicle(to),
            attempt,
            payload,
            created_at: 0,
            deliver_at: 0,
        }
    }

    fn request(from: VehicleId, to: VehicleId, attempt: AttemptId) -> Message {
        msg(
            from,
            to,
            attempt,
            Payload::RequestOvertake {
                direction: Direction::Left,
                target_lane: 1,
            },
        )
    }

    #[test]
    fn test_follower_acks_with_free_areas_and_follows_maneuver() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let leader = spawn(&mut env, 0, 100.0, 30.0);
        let me = spawn(&mut env, 0, 91.0, 30.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::follower(me, vec![leader, me]);

        p.step(&env, &mut channel, &[request(leader, me, A)], 0, &config);
        assert_eq!(p.state(), ParticipantState::AwaitingDecision);
        let replies = channel.deliver_due(0);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload, Payload::Ack);
        assert_eq!(replies[0].to, Recipient::Vehicle(leader));

        let mut notify = msg(leader, me, A, Payload::LaneChangeNotify { target_lane: 1 });
        notify.to = Recipient::Broadcast;
        p.step(&env, &mut channel, &[notify], 1, &config);
        assert_eq!(p.state(), ParticipantState::InManeuver);

        let mut complete = msg(leader, me, A, Payload::Complete);
        complete.to = Recipient::Broadcast;
        p.step(&env, &mut channel, &[complete], 2, &config);
        assert_eq!(p.state(), ParticipantState::Idle);
        assert!(p.engagement().is_none());
    }

    #[test]
    fn test_follower_rejects_occupied_rear_area() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let leader = spawn(&mut env, 0, 100.0, 25.0);
        let me = spawn(&mut env, 0, 91.0, 25.0);
        spawn(&mut env, 1, 70.0, 33.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::follower(me, vec![leader, me]);

        p.step(&env, &mut channel, &[request(leader, me, A)], 0, &config);
        assert_eq!(p.state(), ParticipantState::Idle);
        assert_eq!(
            channel.deliver_due(0)[0].payload,
            Payload::Reject {
                cause: RejectCause::RearAreaOccupied
            }
        );
    }

    #[test]
    fn test_busy_participant_rejects_second_leader() {
        let config = OvertakingConfig::default();
        let env = StubTraffic::new(2, 36.0);
        let mut channel = ReliableChannel::new();
        let me = VehicleId(5);
        let mut p = Participant::neighbor(me, ResponsePolicy::AlwaysAck);

        p.step(&env, &mut channel, &[request(VehicleId(1), me, A)], 0, &config);
        p.step(&env, &mut channel, &[request(VehicleId(2), me, AttemptId(4))], 1, &config);

        let replies = channel.deliver_due(1);
        assert_eq!(replies[1].to, Recipient::Vehicle(VehicleId(2)));
        assert_eq!(replies[1].payload, Payload::Reject { cause: RejectCause::Busy });
        assert_eq!(p.engagement().map(|e| e.leader), Some(VehicleId(1)));
    }

    #[test]
    fn test_messages_from_other_leaders_ignored() {
        let config = OvertakingConfig::default();
        let env = StubTraffic::new(2, 36.0);
        let mut channel = ReliableChannel::new();
        let me = VehicleId(5);
        let mut p = Participant::neighbor(me, ResponsePolicy::AlwaysAck);

        p.step(&env, &mut channel, &[request(VehicleId(1), me, A)], 0, &config);
        let mut abort = msg(VehicleId(2), me, AttemptId(9), Payload::Abort { reason: AbortReason::TimeExceeded });
        abort.to = Recipient::Broadcast;
        p.step(&env, &mut channel, &[abort], 1, &config);
        assert_eq!(p.state(), ParticipantState::AwaitingDecision);
    }

    #[test]
    fn test_silent_never_answers() {
        let config = OvertakingConfig::default();
        let env = StubTraffic::new(2, 36.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::neighbor(VehicleId(5), ResponsePolicy::Silent);

        p.step(&env, &mut channel, &[request(VehicleId(1), VehicleId(5), A)], 0, &config);
        assert!(channel.deliver_due(10).is_empty());
        assert_eq!(p.state(), ParticipantState::Idle);
    }

    #[test]
    fn test_awaiting_decision_times_out() {
        let config = OvertakingConfig::default();
        let env = StubTraffic::new(2, 36.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::neighbor(VehicleId(5), ResponsePolicy::AlwaysAck);

        p.step(&env, &mut channel, &[request(VehicleId(1), VehicleId(5), A)], 10, &config);
        p.step(&env, &mut channel, &[], 29, &config);
        assert_eq!(p.state(), ParticipantState::AwaitingDecision);
        p.step(&env, &mut channel, &[], 30, &config);
        assert_eq!(p.state(), ParticipantState::Idle);
    }

    #[test]
    fn test_cut_in_rejected_when_too_close() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let leader = spawn(&mut env, 0, 100.0, 25.0);
        let me = spawn(&mut env, 1, 80.0, 33.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::neighbor(me, ResponsePolicy::AssessCutIn);

        p.step(&env, &mut channel, &[request(leader, me, A)], 0, &config);
        assert_eq!(channel.deliver_due(0)[0].payload, Payload::Reject { cause: RejectCause::CutIn });

        env.set_position(me, -100.0);
        p.step(&env, &mut channel, &[request(leader, me, AttemptId(4))], 1, &config);
        assert_eq!(channel.deliver_due(1)[0].payload, Payload::Ack);
    }

    #[test]
    fn test_follower_requests_abort_during_own_lane_change() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let leader = spawn(&mut env, 0, 100.0, 25.0);
        let me = spawn(&mut env, 0, 91.0, 25.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::follower(me, vec![leader, me]);

        p.step(&env, &mut channel, &[request(leader, me, A)], 0, &config);
        let mut notify = msg(leader, me, A, Payload::LaneChangeNotify { target_lane: 1 });
        notify.to = Recipient::Broadcast;
        p.step(&env, &mut channel, &[notify], 1, &config);
        channel.deliver_due(1);

        // Halfway into the lane change, a fast car closes in from behind
        env.set_lateral_offset(me, 1.0);
        spawn(&mut env, 1, 80.0, 36.0);
        p.step(&env, &mut channel, &[], 2, &config);
        assert_eq!(p.state(), ParticipantState::AbortRequested);
        let sent = channel.deliver_due(2);
        assert_eq!(sent[0].payload, Payload::Abort { reason: AbortReason::Requested });
        assert_eq!(sent[0].to, Recipient::Vehicle(leader));
    }

    #[test]
    fn test_new_attempt_from_same_leader_replaces_engagement() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let leader = spawn(&mut env, 0, 100.0, 30.0);
        let me = spawn(&mut env, 0, 91.0, 30.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::follower(me, vec![leader, me]);

        // The first attempt died without a word to the followers
        p.step(&env, &mut channel, &[request(leader, me, A)], 0, &config);
        channel.deliver_due(0);
        p.step(&env, &mut channel, &[request(leader, me, AttemptId(4))], 2, &config);

        let replies = channel.deliver_due(2);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].attempt, AttemptId(4));
        assert_eq!(replies[0].payload, Payload::Ack);
        assert_eq!(p.state(), ParticipantState::AwaitingDecision);
        assert_eq!(p.engagement().map(|e| (e.attempt, e.since)), Some((AttemptId(4), 2)));

        // A late copy of the old request changes nothing
        p.step(&env, &mut channel, &[request(leader, me, A)], 3, &config);
        assert!(channel.deliver_due(3).is_empty());
        assert_eq!(p.engagement().map(|e| e.attempt), Some(AttemptId(4)));
    }

    #[test]
    fn test_follower_requests_abort_when_returning_lane_fills() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let leader = spawn(&mut env, 0, 100.0, 25.0);
        let me = spawn(&mut env, 0, 91.0, 25.0);
        let mut channel = ReliableChannel::new();
        let mut p = Participant::follower(me, vec![leader, me]);

        p.step(&env, &mut channel, &[request(leader, me, A)], 0, &config);
        let mut notify = msg(leader, me, A, Payload::LaneChangeNotify { target_lane: 1 });
        notify.to = Recipient::Broadcast;
        p.step(&env, &mut channel, &[notify], 1, &config);

        env.set_lane(me, 1);
        p.step(&env, &mut channel, &[], 2, &config);
        assert_eq!(p.engagement().map(|e| e.returning), Some(true));
        channel.deliver_due(2);

        // Back across the marking, a fast car closes in behind in the original lane
        env.set_lane(me, 0);
        env.set_lateral_offset(me, 1.0);
        let rear = env.telemetry(me).unwrap().rear_position();
        spawn(&mut env, 0, rear - 2.0, 36.0);
        p.step(&env, &mut channel, &[], 3, &config);

        assert_eq!(p.state(), ParticipantState::AbortRequested);
        let sent = channel.deliver_due(3);
        assert_eq!(sent[0].payload, Payload::Abort { reason: AbortReason::Requested });
    }
}
