//! The per-step driver of the overtaking protocol.
//!
//! The coordinator owns every platoon, participant and attempt. Attempts
//! live in an arena keyed by [`AttemptId`]; they are created at trigger
//! time and archived as [`AttemptRecord`]s when they reach a terminal
//! outcome.
//!
//! One call to [`overtaking_step`](OvertakingCoordinator::overtaking_step):
//!
//! ```text
//! sync telemetry
//!   -> deliver due messages -> participants answer
//!   -> deliver due messages -> attempts advance (ascending id)
//!   -> archive terminal attempts -> trigger check for idle platoons
//! ```

use crate::attempt::{AttemptId, AttemptRecord, OvertakingAttempt, Outcome};
use crate::channel::{Channel, ChannelStats, SimChannel};
use crate::config::OvertakingConfig;
use crate::decision::{assess_trigger, TriggerAssessment};
use crate::error::{ConfigError, CoordinatorError};
use crate::message::{Message, Recipient, Step};
use crate::participant::{Participant, ResponsePolicy};
use crate::platoon::{Platoon, PlatoonId, PlatoonSpec};
use overtake_env::{Direction, LaneIndex, Side, TrafficEnvironment, VehicleId, VehicleTelemetry};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

/// Per-platoon bookkeeping.
#[derive(Debug)]
struct PlatoonSlot {
    platoon: Platoon,
    active: Option<AttemptId>,
    backoff: u32,
    cooldown_until: Step,
}

/// Drives all overtaking attempts of all platoons.
pub struct OvertakingCoordinator<C: Channel = SimChannel> {
    config: OvertakingConfig,
    channel: C,
    platoons: BTreeMap<PlatoonId, PlatoonSlot>,
    attempts: BTreeMap<AttemptId, OvertakingAttempt>,
    participants: BTreeMap<VehicleId, Participant>,
    participant_inbox: BTreeMap<VehicleId, Vec<Message>>,
    neighbors: BTreeSet<VehicleId>,
    records: Vec<AttemptRecord>,
    next_platoon: u32,
    next_attempt: u64,
    last_step: Option<Step>,
}

impl OvertakingCoordinator<SimChannel> {
    /// Creates a coordinator with a seeded simulated channel.
    pub fn seeded(config: OvertakingConfig, seed: u64) -> Result<Self, ConfigError> {
        let channel = SimChannel::seeded(seed, &config);
        Self::new(config, channel)
    }
}

impl<C: Channel> OvertakingCoordinator<C> {
    /// Creates a coordinator. The configuration is validated here.
    pub fn new(config: OvertakingConfig, channel: C) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            channel,
            platoons: BTreeMap::new(),
            attempts: BTreeMap::new(),
            participants: BTreeMap::new(),
            participant_inbox: BTreeMap::new(),
            neighbors: BTreeSet::new(),
            records: Vec::new(),
            next_platoon: 0,
            next_attempt: 0,
            last_step: None,
        })
    }

    pub fn config(&self) -> &OvertakingConfig {
        &self.config
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn platoon(&self, id: PlatoonId) -> Option<&Platoon> {
        self.platoons.get(&id).map(|slot| &slot.platoon)
    }

    pub fn platoons(&self) -> impl Iterator<Item = &Platoon> {
        self.platoons.values().map(|slot| &slot.platoon)
    }

    pub fn attempt(&self, id: AttemptId) -> Option<&OvertakingAttempt> {
        self.attempts.get(&id)
    }

    /// Active attempts in ascending id order.
    pub fn attempts(&self) -> impl Iterator<Item = &OvertakingAttempt> {
        self.attempts.values()
    }

    /// The running attempt of a platoon, if any.
    pub fn active_attempt(&self, platoon: PlatoonId) -> Option<&OvertakingAttempt> {
        self.platoons
            .get(&platoon)
            .and_then(|slot| slot.active)
            .and_then(|id| self.attempts.get(&id))
    }

    /// Archived attempts in the order they ended.
    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn participant(&self, vehicle: VehicleId) -> Option<&Participant> {
        self.participants.get(&vehicle)
    }

    /// First step at which the platoon may trigger again.
    pub fn cooldown_until(&self, platoon: PlatoonId) -> Option<Step> {
        self.platoons.get(&platoon).map(|slot| slot.cooldown_until)
    }

    /// Spawns a platoon into the environment and registers its followers
    /// as participants.
    pub fn build_platoon<E: TrafficEnvironment + ?Sized>(
        &mut self,
        env: &mut E,
        spec: &PlatoonSpec,
    ) -> Result<PlatoonId, CoordinatorError> {
        let id = PlatoonId(self.next_platoon);
        let platoon = spec.spawn(env, id, &self.config)?;
        self.next_platoon += 1;

        let members = platoon.member_ids();
        for follower in platoon.followers() {
            self.participants
                .insert(follower.id, Participant::follower(follower.id, members.clone()));
        }
        info!("Platoon {} built: {:?}", id, members);
        self.platoons.insert(
            id,
            PlatoonSlot {
                platoon,
                active: None,
                backoff: self.config.min_backoff,
                cooldown_until: 0,
            },
        );
        Ok(id)
    }

    /// Registers an external cooperative vehicle.
    pub fn register_neighbor(&mut self, vehicle: VehicleId, policy: ResponsePolicy) -> Result<(), CoordinatorError> {
        let is_member = self.platoons.values().any(|slot| slot.platoon.is_member(vehicle));
        if is_member || self.participants.contains_key(&vehicle) {
            warn!("Refusing to register {} twice", vehicle);
            return Err(CoordinatorError::AlreadyParticipant(vehicle));
        }
        debug!("Registered neighbor {} ({:?})", vehicle, policy);
        self.participants.insert(vehicle, Participant::neighbor(vehicle, policy));
        self.neighbors.insert(vehicle);
        Ok(())
    }

    /// Removes a platoon. Not allowed while one of its attempts is running.
    pub fn dissolve_platoon(&mut self, id: PlatoonId) -> Result<Platoon, CoordinatorError> {
        let slot = self.platoons.get(&id).ok_or(CoordinatorError::UnknownPlatoon(id))?;
        if slot.active.is_some() {
            warn!("Platoon {} cannot be dissolved during a maneuver", id);
            return Err(CoordinatorError::MembershipLocked(id));
        }
        let slot = self.platoons.remove(&id).ok_or(CoordinatorError::UnknownPlatoon(id))?;
        for follower in slot.platoon.followers() {
            self.participants.remove(&follower.id);
            self.participant_inbox.remove(&follower.id);
        }
        info!("Platoon {} dissolved", id);
        Ok(slot.platoon)
    }

    /// Starts an attempt right away, skipping the speed trigger and the
    /// back-off. Fails without touching any state if the platoon is busy.
    pub fn request_overtake<E: TrafficEnvironment + ?Sized>(
        &mut self,
        env: &E,
        id: PlatoonId,
        now: Step,
    ) -> Result<AttemptId, CoordinatorError> {
        let Some(slot) = self.platoons.get(&id) else {
            warn!("Overtake requested for unknown platoon {}", id);
            return Err(CoordinatorError::UnknownPlatoon(id));
        };
        if let Some(attempt) = slot.active {
            warn!("Platoon {} already runs attempt {}", id, attempt);
            return Err(CoordinatorError::AttemptAlreadyActive { platoon: id, attempt });
        }
        let lane = slot.platoon.lane();
        let Some(target_lane) = Direction::Left.apply(lane, env.lane_count()) else {
            warn!("Platoon {} has no lane to overtake in", id);
            return Err(CoordinatorError::NoOvertakingLane { lane });
        };

        let mut platoon = slot.platoon.clone();
        platoon.sync(env)?;
        let obstacle = env
            .nearest(platoon.leader().id, Direction::Same, Side::Front, self.config.detection_range_front)
            .map(|n| n.id);

        if let Some(slot) = self.platoons.get_mut(&id) {
            slot.platoon = platoon;
        }
        Ok(self.start_attempt(env, id, target_lane, obstacle, now))
    }

    /// Advances every platoon, participant and attempt by one step.
    pub fn overtaking_step<E: TrafficEnvironment + ?Sized>(&mut self, env: &mut E, now: Step) {
        if let Some(last) = self.last_step {
            if now <= last {
                warn!("Ignoring step {} (last step was {})", now, last);
                return;
            }
        }
        self.last_step = Some(now);

        let mut out_of_sync = BTreeSet::new();
        for (id, slot) in self.platoons.iter_mut() {
            if let Err(e) = slot.platoon.sync(&*env) {
                warn!("Platoon {} telemetry sync failed: {}", id, e);
                out_of_sync.insert(*id);
            }
        }

        let due = self.channel.deliver_due(now);
        self.route(due);

        for (vehicle, participant) in self.participants.iter_mut() {
            let inbox = self.participant_inbox.remove(vehicle).unwrap_or_default();
            participant.step(&*env, &mut self.channel, &inbox, now, &self.config);
        }

        let due = self.channel.deliver_due(now);
        self.route(due);

        let ids: Vec<AttemptId> = self.attempts.keys().copied().collect();
        for id in ids {
            let outcome = {
                let Some(attempt) = self.attempts.get_mut(&id) else {
                    continue;
                };
                let Some(slot) = self.platoons.get(&attempt.platoon()) else {
                    continue;
                };
                attempt.step(env, &mut self.channel, &slot.platoon, now, &self.config)
            };
            if outcome.is_terminal() {
                self.archive(id, now);
            }
        }

        let mut triggers = Vec::new();
        for (id, slot) in &self.platoons {
            if slot.active.is_some() || now < slot.cooldown_until || out_of_sync.contains(id) {
                continue;
            }
            match assess_trigger(&*env, &slot.platoon, &self.config) {
                TriggerAssessment::Trigger {
                    obstacle,
                    deficit,
                    predicted_time,
                    target_lane,
                } => {
                    debug!(
                        "Platoon {}: {} ahead at {:.1} m, deficit {:.2} m/s, predicted {:.1}s",
                        id, obstacle.id, obstacle.distance, deficit, predicted_time
                    );
                    triggers.push((*id, target_lane, obstacle.id));
                }
                TriggerAssessment::Hold(reason) => {
                    trace!("Platoon {}: holding ({:?})", id, reason);
                }
            }
        }
        for (id, target_lane, obstacle) in triggers {
            self.start_attempt(&*env, id, target_lane, Some(obstacle), now);
        }
    }

    fn start_attempt<E: TrafficEnvironment + ?Sized>(
        &mut self,
        env: &E,
        platoon: PlatoonId,
        target_lane: LaneIndex,
        obstacle: Option<VehicleId>,
        now: Step,
    ) -> AttemptId {
        let id = AttemptId(self.next_attempt);
        self.next_attempt += 1;

        let Some(slot) = self.platoons.get_mut(&platoon) else {
            return id;
        };
        let responders = response_set(env, &slot.platoon, &self.neighbors, target_lane, &self.config);
        let attempt = OvertakingAttempt::start(&mut self.channel, id, &slot.platoon, target_lane, obstacle, responders, now);
        slot.active = Some(id);
        self.attempts.insert(id, attempt);
        id
    }

    fn archive(&mut self, id: AttemptId, now: Step) {
        let Some(attempt) = self.attempts.remove(&id) else {
            return;
        };
        let record = attempt.record(&self.config);
        if let Some(slot) = self.platoons.get_mut(&attempt.platoon()) {
            slot.active = None;
            match attempt.outcome() {
                Outcome::Completed => {
                    slot.backoff = self.config.min_backoff;
                    slot.cooldown_until = now + self.config.secs_to_steps(self.config.stay_in_original_lane_time);
                    if let Some(fsm) = attempt.lane_change() {
                        slot.platoon.set_lane(fsm.intended_lane(&self.config));
                    }
                }
                _ => {
                    slot.cooldown_until = now + (1u64 << slot.backoff);
                    slot.backoff = (slot.backoff + 1).min(self.config.max_backoff);
                }
            }
            debug!("Platoon {} may trigger again at step {}", slot.platoon.id(), slot.cooldown_until);
        }
        self.records.push(record);
    }

    /// Hands delivered messages to the attempt of the addressed leader or
    /// to participants.
    fn route(&mut self, messages: Vec<Message>) {
        for message in messages {
            match message.to {
                Recipient::Vehicle(vehicle) => {
                    let leading = self.attempts.values_mut().find(|a| a.leader() == vehicle);
                    if let Some(attempt) = leading {
                        if attempt.id() == message.attempt {
                            attempt.deliver(message);
                        } else {
                            trace!("Dropping stale {} for {} from {}", message.payload.kind(), vehicle, message.attempt);
                        }
                    } else if self.participants.contains_key(&vehicle) {
                        self.participant_inbox.entry(vehicle).or_default().push(message);
                    } else {
                        trace!("Dropping {} for {}: no active attempt", message.payload.kind(), vehicle);
                    }
                }
                Recipient::Broadcast => {
                    for vehicle in self.participants.keys() {
                        if *vehicle != message.from {
                            self.participant_inbox.entry(*vehicle).or_default().push(message.clone());
                        }
                    }
                }
            }
        }
    }
}

/// Vehicles that must answer before a lane change may start: all followers
/// plus registered neighbors near the platoon that are in the target lane or
/// already moving into it.
fn response_set<E: TrafficEnvironment + ?Sized>(
    env: &E,
    platoon: &Platoon,
    neighbors: &BTreeSet<VehicleId>,
    target_lane: LaneIndex,
    config: &OvertakingConfig,
) -> BTreeSet<VehicleId> {
    let mut set: BTreeSet<VehicleId> = platoon.followers().iter().map(|f| f.id).collect();
    let (rear, front) = platoon.extent();
    for vehicle in neighbors {
        let Some(t) = env.telemetry(*vehicle) else {
            continue;
        };
        if approaching_lane(&t, target_lane, config.centering_tolerance)
            && t.position >= rear - config.neighbor_radius
            && t.rear_position() <= front + config.neighbor_radius
        {
            set.insert(*vehicle);
        }
    }
    set
}

/// In `lane`, or off-center toward it from an adjacent lane.
fn approaching_lane(t: &VehicleTelemetry, lane: LaneIndex, tolerance: f64) -> bool {
    if t.lane == lane {
        return true;
    }
    match Direction::between(t.lane, lane) {
        Direction::Left => t.lane + 1 == lane && t.lateral_offset > tolerance,
        Direction::Right => lane + 1 == t.lane && t.lateral_offset < -tolerance,
        Direction::Same => false,
    }
}
