//! Lane-change phase: moves an approved platoon around the slower vehicle.
//!
//! ```text
//! Preparing --areas free--> ChangingLane --all members moved--> Merging --settled--> Completed
//!     |                          |                                 |
//!     '--------------------------+---------------------------------+---> Aborted
//! ```
//!
//! Members change lanes one at a time, leader first. The next member is
//! commanded only once its predecessor sits centered in the new lane, so
//! the platoon is either fully in one lane or shifting front to back.

use crate::attempt::AttemptId;
use crate::channel::Channel;
use crate::config::OvertakingConfig;
use crate::message::{AbortReason, Message, Payload, Recipient, Step};
use crate::platoon::Platoon;
use crate::safety::{front_area, rear_area, safety_dist_slower, AreaStatus};
use overtake_env::{Direction, LaneIndex, TrafficEnvironment, VehicleId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// States of the lane-change phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaneChangeState {
    Preparing,
    ChangingLane,
    Merging,
    Completed,
    Aborted,
}

impl LaneChangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LaneChangeState::Completed | LaneChangeState::Aborted)
    }
}

/// Sub-stage of `Merging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeStage {
    /// Cruising in the overtaking lane until the slower vehicle is passed
    Holding,
    /// Moving members back, one at a time
    Returning,
    /// Waiting for lane centering and speed
    Settling,
}

/// Progress of a one-member-at-a-time lane change sequence.
enum Sequence {
    InProgress,
    Done,
    Blocked(VehicleId),
    Fault,
}

/// Per-step inputs of the lane-change machine.
pub struct ManeuverContext<'a> {
    pub attempt: AttemptId,
    pub platoon: &'a Platoon,
    pub triggered_at: Step,
    pub now: Step,
    pub config: &'a OvertakingConfig,
}

/// Lane-change state machine of one attempt.
#[derive(Debug, Clone)]
pub struct LaneChangeFsm {
    state: LaneChangeState,
    merge: MergeStage,
    original_lane: LaneIndex,
    target_lane: LaneIndex,
    obstacle: Option<VehicleId>,
    notified: bool,
    next: usize,
    awaiting: Option<VehicleId>,
    not_detected: u32,
    abort_reason: Option<AbortReason>,
    command_order: Vec<VehicleId>,
    visited: Vec<LaneChangeState>,
}

impl LaneChangeFsm {
    /// Starts in `Preparing`.
    pub fn new(original_lane: LaneIndex, target_lane: LaneIndex, obstacle: Option<VehicleId>) -> Self {
        Self {
            state: LaneChangeState::Preparing,
            merge: MergeStage::Holding,
            original_lane,
            target_lane,
            obstacle,
            notified: false,
            next: 0,
            awaiting: None,
            not_detected: 0,
            abort_reason: None,
            command_order: Vec::new(),
            visited: vec![LaneChangeState::Preparing],
        }
    }

    pub fn state(&self) -> LaneChangeState {
        self.state
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    /// Vehicles in the order they were commanded to change lanes.
    pub fn command_order(&self) -> &[VehicleId] {
        &self.command_order
    }

    pub fn visited(&self) -> &[LaneChangeState] {
        &self.visited
    }

    /// Lane the platoon ends up in after completion.
    pub fn intended_lane(&self, config: &OvertakingConfig) -> LaneIndex {
        if config.return_to_original_lane {
            self.original_lane
        } else {
            self.target_lane
        }
    }

    fn transition(&mut self, attempt: AttemptId, next: LaneChangeState) {
        debug!("Attempt {}: lane change {:?} -> {:?}", attempt, self.state, next);
        self.state = next;
        self.visited.push(next);
    }

    /// Advances the machine by one step. The overtaking time cap is checked
    /// before anything else.
    pub fn step<E, C>(&mut self, env: &mut E, channel: &mut C, ctx: &ManeuverContext<'_>, inbox: &[Message]) -> LaneChangeState
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        if self.state.is_terminal() {
            return self.state;
        }

        let elapsed = ctx.now.saturating_sub(ctx.triggered_at);
        if elapsed >= ctx.config.max_overtaking_steps() {
            info!(
                "Attempt {}: overtaking time cap reached after {:.1}s",
                ctx.attempt,
                ctx.config.steps_to_secs(elapsed)
            );
            self.abort(env, channel, ctx, AbortReason::TimeExceeded);
            return self.state;
        }

        let requested = inbox
            .iter()
            .find(|m| m.attempt == ctx.attempt && matches!(m.payload, Payload::Abort { .. }));
        if let Some(message) = requested {
            info!("Attempt {}: abort requested by {}", ctx.attempt, message.from);
            self.abort(env, channel, ctx, AbortReason::Requested);
            return self.state;
        }

        match self.state {
            LaneChangeState::Preparing => self.prepare(env, channel, ctx),
            LaneChangeState::ChangingLane => self.changing_lane(env, channel, ctx),
            LaneChangeState::Merging => self.merging(env, channel, ctx),
            LaneChangeState::Completed | LaneChangeState::Aborted => {}
        }
        self.state
    }

    fn prepare<E, C>(&mut self, env: &mut E, channel: &mut C, ctx: &ManeuverContext<'_>)
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        let platoon = ctx.platoon;
        if !self.notified {
            for follower in platoon.followers() {
                if let Err(e) = env.command_gap(follower.id, ctx.config.inter_vehicle_distance) {
                    warn!("Attempt {}: gap command for {} failed: {}", ctx.attempt, follower.id, e);
                    self.abort(env, channel, ctx, AbortReason::EnvironmentFault);
                    return;
                }
            }
            channel.send(
                platoon.leader().id,
                Recipient::Broadcast,
                ctx.attempt,
                Payload::LaneChangeNotify {
                    target_lane: self.target_lane,
                },
                ctx.now,
            );
            self.notified = true;
        }

        let direction = Direction::between(self.original_lane, self.target_lane);
        if self.areas_free(env, ctx, direction) {
            self.next = 0;
            self.transition(ctx.attempt, LaneChangeState::ChangingLane);
        }
    }

    fn changing_lane<E, C>(&mut self, env: &mut E, channel: &mut C, ctx: &ManeuverContext<'_>)
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        if !self.obstacle_visible(env, ctx) {
            self.not_detected += 1;
            trace!("Attempt {}: slower vehicle not detected ({})", ctx.attempt, self.not_detected);
            if self.not_detected > ctx.config.max_not_detected {
                self.abort(env, channel, ctx, AbortReason::ObstacleLost);
                return;
            }
        } else {
            self.not_detected = 0;
        }

        let direction = Direction::between(self.original_lane, self.target_lane);
        match self.drive_sequence(env, ctx, self.target_lane, direction) {
            Sequence::InProgress => {}
            Sequence::Done => {
                self.merge = if ctx.config.return_to_original_lane {
                    MergeStage::Holding
                } else {
                    MergeStage::Settling
                };
                self.transition(ctx.attempt, LaneChangeState::Merging);
            }
            Sequence::Blocked(culprit) => {
                debug!("Attempt {}: target lane blocked by {}", ctx.attempt, culprit);
                self.abort(env, channel, ctx, AbortReason::AreaOccupied);
            }
            Sequence::Fault => self.abort(env, channel, ctx, AbortReason::EnvironmentFault),
        }
    }

    fn merging<E, C>(&mut self, env: &mut E, channel: &mut C, ctx: &ManeuverContext<'_>)
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        match self.merge {
            MergeStage::Holding => {
                if !self.obstacle_passed(env, ctx) {
                    return;
                }
                let direction = Direction::between(self.target_lane, self.original_lane);
                if self.areas_free(env, ctx, direction) {
                    debug!("Attempt {}: slower vehicle passed, returning", ctx.attempt);
                    self.next = 0;
                    self.merge = MergeStage::Returning;
                }
            }
            MergeStage::Returning => {
                let direction = Direction::between(self.target_lane, self.original_lane);
                match self.drive_sequence(env, ctx, self.original_lane, direction) {
                    Sequence::Done => self.merge = MergeStage::Settling,
                    // Wait for the gap to open again
                    Sequence::InProgress | Sequence::Blocked(_) => {}
                    Sequence::Fault => self.abort(env, channel, ctx, AbortReason::EnvironmentFault),
                }
            }
            MergeStage::Settling => {
                let lane = self.intended_lane(ctx.config);
                let platoon = ctx.platoon;
                if platoon.all_in_lane(lane, ctx.config.centering_tolerance)
                    && platoon.at_desired_speed(ctx.config.speed_settle_tolerance)
                {
                    channel.send(platoon.leader().id, Recipient::Broadcast, ctx.attempt, Payload::Complete, ctx.now);
                    self.transition(ctx.attempt, LaneChangeState::Completed);
                }
            }
        }
    }

    /// Leader's front area and last member's rear area toward `direction`.
    fn areas_free<E: TrafficEnvironment + ?Sized>(&self, env: &E, ctx: &ManeuverContext<'_>, direction: Direction) -> bool {
        let platoon = ctx.platoon;
        let members = platoon.member_ids();
        let front = front_area(env, ctx.config, &platoon.leader().telemetry, direction, false, &members);
        let rear = rear_area(env, ctx.config, &platoon.last().telemetry, direction, false, &members);
        if let AreaStatus::Occupied { culprit, distance, required } = front {
            trace!("Attempt {}: front area held by {} ({:.1} < {:.1})", ctx.attempt, culprit, distance, required);
        }
        if let AreaStatus::Occupied { culprit, distance, required } = rear {
            trace!("Attempt {}: rear area held by {} ({:.1} < {:.1})", ctx.attempt, culprit, distance, required);
        }
        front.is_free() && rear.is_free()
    }

    /// Commands at most one member per step toward `lane`, after confirming
    /// the previously commanded one.
    fn drive_sequence<E: TrafficEnvironment + ?Sized>(
        &mut self,
        env: &mut E,
        ctx: &ManeuverContext<'_>,
        lane: LaneIndex,
        direction: Direction,
    ) -> Sequence {
        let tolerance = ctx.config.centering_tolerance;
        if let Some(id) = self.awaiting {
            let Some(t) = env.telemetry(id) else {
                return Sequence::Fault;
            };
            if t.lane != lane || !t.is_centered(tolerance) {
                return Sequence::InProgress;
            }
            debug!("Attempt {}: {} confirmed in lane {}", ctx.attempt, id, lane);
            self.awaiting = None;
            self.next += 1;
        }

        let members = ctx.platoon.members();
        let Some(member) = members.get(self.next) else {
            return Sequence::Done;
        };
        let Some(t) = env.telemetry(member.id) else {
            return Sequence::Fault;
        };
        let ids = ctx.platoon.member_ids();
        if let AreaStatus::Occupied { culprit, .. } = rear_area(env, ctx.config, &t, direction, true, &ids) {
            return Sequence::Blocked(culprit);
        }
        if let Err(e) = env.command_lane_change(member.id, lane) {
            warn!("Attempt {}: lane change command for {} failed: {}", ctx.attempt, member.id, e);
            return Sequence::Fault;
        }
        debug!("Attempt {}: commanding {} to lane {}", ctx.attempt, member.id, lane);
        self.awaiting = Some(member.id);
        self.command_order.push(member.id);
        Sequence::InProgress
    }

    fn obstacle_visible<E: TrafficEnvironment + ?Sized>(&self, env: &E, ctx: &ManeuverContext<'_>) -> bool {
        let Some(obstacle) = self.obstacle else {
            return true;
        };
        let Some(t) = env.telemetry(obstacle) else {
            return false;
        };
        let (rear, front) = ctx.platoon.extent();
        t.position <= front + ctx.config.detection_range_front && t.position >= rear - ctx.config.detection_range_rear
    }

    /// The last member's rear is ahead of the slower vehicle by its safety
    /// distance, or the slower vehicle is gone.
    fn obstacle_passed<E: TrafficEnvironment + ?Sized>(&self, env: &E, ctx: &ManeuverContext<'_>) -> bool {
        let Some(obstacle) = self.obstacle.and_then(|id| env.telemetry(id)) else {
            return true;
        };
        let (rear, _) = ctx.platoon.extent();
        rear - obstacle.position >= safety_dist_slower(ctx.config, obstacle.speed)
    }

    /// Broadcasts `Abort` and sends every moved member back.
    fn abort<E, C>(&mut self, env: &mut E, channel: &mut C, ctx: &ManeuverContext<'_>, reason: AbortReason)
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        let platoon = ctx.platoon;
        channel.send(
            platoon.leader().id,
            Recipient::Broadcast,
            ctx.attempt,
            Payload::Abort { reason },
            ctx.now,
        );
        for member in platoon.members() {
            let moved = env
                .telemetry(member.id)
                .map(|t| t.lane != self.original_lane || !t.is_centered(ctx.config.centering_tolerance))
                .unwrap_or(false);
            if moved || self.awaiting == Some(member.id) {
                debug!("Attempt {}: reverting {} to lane {}", ctx.attempt, member.id, self.original_lane);
                if let Err(e) = env.command_lane_change(member.id, self.original_lane) {
                    warn!("Attempt {}: revert of {} failed: {}", ctx.attempt, member.id, e);
                }
            }
        }
        self.awaiting = None;
        self.abort_reason = Some(reason);
        self.transition(ctx.attempt, LaneChangeState::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ReliableChannel;
    use crate::platoon::{PlatoonId, PlatoonSpec};
    use overtake_env::{Command, StubTraffic, VehicleSpawn, VehicleType};

    const A: AttemptId = AttemptId(0);

    struct Rig {
        env: StubTraffic,
        channel: ReliableChannel,
        platoon: Platoon,
        truck: VehicleId,
        config: OvertakingConfig,
    }

    impl Rig {
        fn new(count: usize, config: OvertakingConfig) -> Self {
            let mut env = StubTraffic::new(2, 36.0);
            let platoon = PlatoonSpec {
                count,
                desired_speed: 30.0,
                vehicle_type: VehicleType::platoon_car(),
                route: "freeway".to_string(),
                start_position: 0.0,
                lane: 0,
            }
            .spawn(&mut env, PlatoonId(0), &config)
            .unwrap();
            let truck = env
                .spawn_vehicle(VehicleSpawn {
                    vehicle_type: VehicleType::truck(),
                    route: "freeway".to_string(),
                    position: platoon.leader().position() + 60.0,
                    lane: 0,
                    speed: 30.0,
                })
                .unwrap();
            Self {
                env,
                channel: ReliableChannel::new(),
                platoon,
                truck,
                config,
            }
        }

        fn step(&mut self, fsm: &mut LaneChangeFsm, now: Step, inbox: &[Message]) -> LaneChangeState {
            self.platoon.sync(&self.env).unwrap();
            let ctx = ManeuverContext {
                attempt: A,
                platoon: &self.platoon,
                triggered_at: 0,
                now,
                config: &self.config,
            };
            fsm.step(&mut self.env, &mut self.channel, &ctx, inbox)
        }
    }

    #[test]
    fn test_members_change_one_at_a_time_leader_first() {
        let mut rig = Rig::new(4, OvertakingConfig::default());
        let mut fsm = LaneChangeFsm::new(0, 1, Some(rig.truck));
        let expected = rig.platoon.member_ids();

        assert_eq!(rig.step(&mut fsm, 1, &[]), LaneChangeState::ChangingLane);
        let notify = rig.channel.deliver_due(1);
        assert_eq!(notify[0].payload, Payload::LaneChangeNotify { target_lane: 1 });

        let mut now = 2;
        for (i, id) in expected.iter().enumerate() {
            rig.step(&mut fsm, now, &[]);
            assert_eq!(rig.env.lane_change_order().len(), i + 1);
            assert_eq!(rig.env.lane_change_order()[i], *id);

            // Unconfirmed predecessor blocks the next command
            rig.step(&mut fsm, now + 1, &[]);
            assert_eq!(rig.env.lane_change_order().len(), i + 1);

            rig.env.apply_pending();
            now += 2;
        }
        assert_eq!(rig.step(&mut fsm, now, &[]), LaneChangeState::Merging);
        assert_eq!(fsm.command_order(), expected.as_slice());
    }

    #[test]
    fn test_full_maneuver_returns_and_completes() {
        let mut rig = Rig::new(3, OvertakingConfig::default());
        rig.env = rig.env.with_instant_lane_changes();
        let mut fsm = LaneChangeFsm::new(0, 1, Some(rig.truck));

        let mut now = 1;
        while fsm.state() != LaneChangeState::Merging {
            rig.step(&mut fsm, now, &[]);
            now += 1;
        }
        // Still alongside the truck
        rig.step(&mut fsm, now, &[]);
        assert_eq!(rig.env.lane_change_order().len(), 3);

        rig.env.set_position(rig.truck, -300.0);
        while fsm.state() == LaneChangeState::Merging && now < 50 {
            now += 1;
            rig.step(&mut fsm, now, &[]);
        }
        assert_eq!(fsm.state(), LaneChangeState::Completed);
        assert_eq!(rig.env.lane_change_order().len(), 6);
        assert!(rig.platoon.all_in_lane(0, 0.1));
        assert_eq!(
            fsm.visited(),
            &[
                LaneChangeState::Preparing,
                LaneChangeState::ChangingLane,
                LaneChangeState::Merging,
                LaneChangeState::Completed
            ]
        );
        let last = rig.channel.deliver_due(now).pop().unwrap();
        assert_eq!(last.payload, Payload::Complete);
        assert_eq!(last.to, Recipient::Broadcast);
    }

    #[test]
    fn test_stay_route_completes_in_target_lane() {
        let config = OvertakingConfig {
            return_to_original_lane: false,
            ..Default::default()
        };
        let mut rig = Rig::new(2, config);
        rig.env = rig.env.with_instant_lane_changes();
        let mut fsm = LaneChangeFsm::new(0, 1, Some(rig.truck));

        let mut now = 1;
        while !fsm.state().is_terminal() && now < 20 {
            rig.step(&mut fsm, now, &[]);
            now += 1;
        }
        assert_eq!(fsm.state(), LaneChangeState::Completed);
        assert_eq!(rig.env.lane_change_order().len(), 2);
        assert_eq!(fsm.intended_lane(&rig.config), 1);
    }

    #[test]
    fn test_time_cap_aborts_and_reverts_commanded_member() {
        let mut rig = Rig::new(2, OvertakingConfig::default());
        let mut fsm = LaneChangeFsm::new(0, 1, Some(rig.truck));
        rig.step(&mut fsm, 1, &[]);
        rig.step(&mut fsm, 2, &[]);
        let leader = rig.platoon.leader().id;
        assert_eq!(rig.env.lane_change_order(), vec![leader]);

        assert_eq!(rig.step(&mut fsm, 449, &[]), LaneChangeState::ChangingLane);
        assert_eq!(rig.step(&mut fsm, 450, &[]), LaneChangeState::Aborted);
        assert_eq!(fsm.abort_reason(), Some(AbortReason::TimeExceeded));
        assert_eq!(rig.env.commands().last(), Some(&Command::LaneChange { id: leader, target: 0 }));

        let sent = rig.channel.deliver_due(450);
        assert!(sent
            .iter()
            .any(|m| m.payload == Payload::Abort { reason: AbortReason::TimeExceeded }));
    }

    #[test]
    fn test_abort_request_from_participant() {
        let mut rig = Rig::new(2, OvertakingConfig::default());
        rig.env = rig.env.with_instant_lane_changes();
        let mut fsm = LaneChangeFsm::new(0, 1, Some(rig.truck));
        rig.step(&mut fsm, 1, &[]);
        rig.step(&mut fsm, 2, &[]);
        let leader = rig.platoon.leader().id;
        let follower = rig.platoon.last().id;

        let request = Message {
            id: crate::message::MessageId(99),
            from: follower,
            to: Recipient::Vehicle(leader),
            attempt: A,
            payload: Payload::Abort {
                reason: AbortReason::Requested,
            },
            created_at: 3,
            deliver_at: 3,
        };
        assert_eq!(rig.step(&mut fsm, 3, &[request]), LaneChangeState::Aborted);
        assert_eq!(fsm.abort_reason(), Some(AbortReason::Requested));
        // Leader had already moved and is sent back
        assert_eq!(rig.env.telemetry(leader).unwrap().lane, 0);
    }

    #[test]
    fn test_obstacle_lost_aborts_after_grace_steps() {
        let mut rig = Rig::new(2, OvertakingConfig::default());
        let mut fsm = LaneChangeFsm::new(0, 1, Some(rig.truck));
        rig.step(&mut fsm, 1, &[]);
        rig.env.remove(rig.truck);

        for now in 2..5 {
            assert_eq!(rig.step(&mut fsm, now, &[]), LaneChangeState::ChangingLane);
        }
        assert_eq!(rig.step(&mut fsm, 5, &[]), LaneChangeState::Aborted);
        assert_eq!(fsm.abort_reason(), Some(AbortReason::ObstacleLost));
    }

    #[test]
    fn test_occupied_rear_area_aborts_lane_change() {
        let mut rig = Rig::new(2, OvertakingConfig::default());
        let mut fsm = LaneChangeFsm::new(0, 1, Some(rig.truck));
        rig.step(&mut fsm, 1, &[]);

        let leader_pos = rig.platoon.leader().position();
        rig.env
            .spawn_vehicle(VehicleSpawn {
                vehicle_type: VehicleType::passenger_car(),
                route: "freeway".to_string(),
                position: leader_pos - 2.0,
                lane: 1,
                speed: 36.0,
            })
            .unwrap();
        assert_eq!(rig.step(&mut fsm, 2, &[]), LaneChangeState::Aborted);
        assert_eq!(fsm.abort_reason(), Some(AbortReason::AreaOccupied));
        assert!(rig.env.lane_change_order().is_empty());
    }
}
