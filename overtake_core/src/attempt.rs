//! Overtaking attempts and their archived records.

use crate::channel::Channel;
use crate::config::OvertakingConfig;
use crate::decision::{DecisionFsm, DecisionState, RejectionReason};
use crate::lane_change::{LaneChangeFsm, LaneChangeState, ManeuverContext};
use crate::message::{AbortReason, Message, Step};
use crate::platoon::{Platoon, PlatoonId};
use overtake_env::{Direction, LaneIndex, TrafficEnvironment, VehicleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

/// Unique identifier for an attempt. Issued in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId(pub u64);

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Phase an attempt is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Decision,
    LaneChange,
    Terminal,
}

/// Outcome of an attempt. `Approved` is only transient while the lane
/// change runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Pending,
    Approved,
    Rejected,
    Completed,
    Aborted,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Rejected | Outcome::Completed | Outcome::Aborted)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Outcome::Pending => "pending",
            Outcome::Approved => "approved",
            Outcome::Rejected => "rejected",
            Outcome::Completed => "completed",
            Outcome::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// One end-to-end overtaking maneuver of a platoon.
#[derive(Debug, Clone)]
pub struct OvertakingAttempt {
    id: AttemptId,
    platoon: PlatoonId,
    leader: VehicleId,
    original_lane: LaneIndex,
    target_lane: LaneIndex,
    obstacle: Option<VehicleId>,
    phase: Phase,
    outcome: Outcome,
    decision: DecisionFsm,
    lane_change: Option<LaneChangeFsm>,
    inbox: Vec<Message>,
    ended_at: Option<Step>,
}

impl OvertakingAttempt {
    /// Creates the attempt and runs the decision trigger: requests go out
    /// to `responders` right away.
    #[allow(clippy::too_many_arguments)]
    pub fn start<C: Channel + ?Sized>(
        channel: &mut C,
        id: AttemptId,
        platoon: &Platoon,
        target_lane: LaneIndex,
        obstacle: Option<VehicleId>,
        responders: BTreeSet<VehicleId>,
        now: Step,
    ) -> Self {
        let leader = platoon.leader().id;
        let original_lane = platoon.lane();
        info!(
            "Attempt {} started for platoon {} (lane {} -> {}, {} responders)",
            id,
            platoon.id(),
            original_lane,
            target_lane,
            responders.len()
        );
        let mut decision = DecisionFsm::new();
        decision.start(
            channel,
            id,
            leader,
            responders,
            target_lane,
            Direction::between(original_lane, target_lane),
            now,
        );
        let mut attempt = Self {
            id,
            platoon: platoon.id(),
            leader,
            original_lane,
            target_lane,
            obstacle,
            phase: Phase::Decision,
            outcome: Outcome::Pending,
            decision,
            lane_change: None,
            inbox: Vec::new(),
            ended_at: None,
        };
        if attempt.decision.state() == DecisionState::Approved {
            attempt.approve();
        }
        attempt
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn platoon(&self) -> PlatoonId {
        self.platoon
    }

    pub fn leader(&self) -> VehicleId {
        self.leader
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn triggered_at(&self) -> Step {
        self.decision.triggered_at()
    }

    /// Steps since the trigger.
    pub fn elapsed(&self, now: Step) -> Step {
        now.saturating_sub(self.triggered_at())
    }

    pub fn decision(&self) -> &DecisionFsm {
        &self.decision
    }

    pub fn lane_change(&self) -> Option<&LaneChangeFsm> {
        self.lane_change.as_ref()
    }

    pub fn target_lane(&self) -> LaneIndex {
        self.target_lane
    }

    pub fn ended_at(&self) -> Option<Step> {
        self.ended_at
    }

    /// Queues a message delivered to the leader for this attempt.
    pub(crate) fn deliver(&mut self, message: Message) {
        self.inbox.push(message);
    }

    fn approve(&mut self) {
        self.outcome = Outcome::Approved;
        self.phase = Phase::LaneChange;
        self.lane_change = Some(LaneChangeFsm::new(self.original_lane, self.target_lane, self.obstacle));
        info!("Attempt {} approved", self.id);
    }

    fn finish(&mut self, outcome: Outcome, now: Step) {
        self.outcome = outcome;
        self.phase = Phase::Terminal;
        self.ended_at = Some(now);
        info!(
            "Attempt {} of platoon {} {} after {} steps",
            self.id,
            self.platoon,
            outcome,
            self.elapsed(now)
        );
    }

    /// Advances the current phase by one step with the queued inbox.
    pub fn step<E, C>(&mut self, env: &mut E, channel: &mut C, platoon: &Platoon, now: Step, config: &OvertakingConfig) -> Outcome
    where
        E: TrafficEnvironment + ?Sized,
        C: Channel + ?Sized,
    {
        let inbox = std::mem::take(&mut self.inbox);
        match self.phase {
            Phase::Decision => match self.decision.step(self.id, now, &inbox, config) {
                DecisionState::Approved => self.approve(),
                DecisionState::Rejected => self.finish(Outcome::Rejected, now),
                _ => {}
            },
            Phase::LaneChange => {
                let ctx = ManeuverContext {
                    attempt: self.id,
                    platoon,
                    triggered_at: self.triggered_at(),
                    now,
                    config,
                };
                let state = match self.lane_change.as_mut() {
                    Some(fsm) => fsm.step(env, channel, &ctx, &inbox),
                    None => LaneChangeState::Aborted,
                };
                match state {
                    LaneChangeState::Completed => self.finish(Outcome::Completed, now),
                    LaneChangeState::Aborted => self.finish(Outcome::Aborted, now),
                    _ => {}
                }
            }
            Phase::Terminal => {}
        }
        self.outcome
    }

    /// Snapshot for the archive.
    pub fn record(&self, config: &OvertakingConfig) -> AttemptRecord {
        let ended_at = self.ended_at.unwrap_or_else(|| self.triggered_at());
        AttemptRecord {
            id: self.id,
            platoon: self.platoon,
            leader: self.leader,
            triggered_at: self.triggered_at(),
            ended_at,
            duration_secs: config.steps_to_secs(ended_at.saturating_sub(self.triggered_at())),
            decision_states: self.decision.visited().to_vec(),
            lane_change_states: self
                .lane_change
                .as_ref()
                .map(|fsm| fsm.visited().to_vec())
                .unwrap_or_default(),
            outcome: self.outcome,
            rejection: self.decision.rejection(),
            abort: self.lane_change.as_ref().and_then(|fsm| fsm.abort_reason()),
            lane_change_order: self
                .lane_change
                .as_ref()
                .map(|fsm| fsm.command_order().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Archived attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub id: AttemptId,
    pub platoon: PlatoonId,
    pub leader: VehicleId,
    pub triggered_at: Step,
    pub ended_at: Step,
    pub duration_secs: f64,
    pub decision_states: Vec<DecisionState>,
    pub lane_change_states: Vec<LaneChangeState>,
    pub outcome: Outcome,
    pub rejection: Option<RejectionReason>,
    pub abort: Option<AbortReason>,

    /// Vehicles in lane-change command order (including the way back)
    pub lane_change_order: Vec<VehicleId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ReliableChannel;
    use crate::platoon::PlatoonSpec;
    use overtake_env::{StubTraffic, VehicleType};

    fn platoon(env: &mut StubTraffic, count: usize) -> Platoon {
        PlatoonSpec {
            count,
            desired_speed: 30.0,
            vehicle_type: VehicleType::platoon_car(),
            route: "freeway".to_string(),
            start_position: 0.0,
            lane: 0,
        }
        .spawn(env, PlatoonId(0), &OvertakingConfig::default())
        .unwrap()
    }

    #[test]
    fn test_rejected_attempt_record() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let mut channel = ReliableChannel::new();
        let p = platoon(&mut env, 2);
        let responders = p.followers().iter().map(|f| f.id).collect();
        let mut attempt = OvertakingAttempt::start(&mut channel, AttemptId(0), &p, 1, None, responders, 10);
        assert_eq!(attempt.phase(), Phase::Decision);

        for now in 11..30 {
            assert_eq!(attempt.step(&mut env, &mut channel, &p, now, &config), Outcome::Pending);
        }
        assert_eq!(attempt.step(&mut env, &mut channel, &p, 30, &config), Outcome::Rejected);

        let record = attempt.record(&config);
        assert_eq!(record.triggered_at, 10);
        assert_eq!(record.ended_at, 30);
        assert_eq!(record.rejection, Some(RejectionReason::Timeout));
        assert!(record.lane_change_states.is_empty());
        assert!((record.duration_secs - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_vehicle_approves_and_enters_preparing() {
        let mut env = StubTraffic::new(2, 36.0);
        let mut channel = ReliableChannel::new();
        let p = platoon(&mut env, 1);
        let attempt = OvertakingAttempt::start(&mut channel, AttemptId(4), &p, 1, None, BTreeSet::new(), 0);
        assert_eq!(attempt.outcome(), Outcome::Approved);
        assert_eq!(attempt.phase(), Phase::LaneChange);
        assert_eq!(attempt.lane_change().map(|fsm| fsm.state()), Some(LaneChangeState::Preparing));
    }
}
