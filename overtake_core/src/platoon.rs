//! Platoon model.
//!
//! A platoon is an ordered list of vehicle handles, index 0 being the
//! leader. The protocol only reads physical state; positions, speeds and
//! lanes are mirrored from the traffic environment once per step.

use crate::config::OvertakingConfig;
use crate::error::CoordinatorError;
use overtake_env::{EnvError, LaneIndex, TrafficEnvironment, VehicleId, VehicleSpawn, VehicleTelemetry, VehicleType};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Unique identifier for a platoon, issued by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlatoonId(pub u32);

impl std::fmt::Display for PlatoonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Position of a vehicle within its platoon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    /// Follower with its 1-based position behind the leader
    Follower(usize),
}

/// A platoon member as seen by the protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub role: Role,
    pub platoon: PlatoonId,

    /// Last synced telemetry
    pub telemetry: VehicleTelemetry,
}

impl Vehicle {
    pub fn lane(&self) -> LaneIndex {
        self.telemetry.lane
    }

    pub fn position(&self) -> f64 {
        self.telemetry.position
    }

    pub fn speed(&self) -> f64 {
        self.telemetry.speed
    }
}

/// Parameters for building a platoon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatoonSpec {
    /// Number of vehicles including the leader
    pub count: usize,

    /// Desired cruising speed (m/s)
    pub desired_speed: f64,

    /// Vehicle class of every member
    pub vehicle_type: VehicleType,

    /// Route the platoon follows
    pub route: String,

    /// Front bumper position of the last member (m)
    pub start_position: f64,

    /// Lane the platoon starts in
    pub lane: LaneIndex,
}

impl PlatoonSpec {
    /// Spawns the members into `env`, leader first.
    ///
    /// Members are placed bumper to bumper with the configured
    /// inter-vehicle gap; the last member's front bumper sits at
    /// `start_position`.
    pub(crate) fn spawn<E: TrafficEnvironment + ?Sized>(
        &self,
        env: &mut E,
        id: PlatoonId,
        config: &OvertakingConfig,
    ) -> Result<Platoon, CoordinatorError> {
        if self.count == 0 {
            return Err(CoordinatorError::PlatoonTooSmall);
        }
        let spacing = config.inter_vehicle_distance + self.vehicle_type.length;
        let mut members = Vec::with_capacity(self.count);
        for i in 0..self.count {
            let position = self.start_position + (self.count - 1 - i) as f64 * spacing;
            let vehicle = env.spawn_vehicle(VehicleSpawn {
                vehicle_type: self.vehicle_type.clone(),
                route: self.route.clone(),
                position,
                lane: self.lane,
                speed: self.desired_speed,
            })?;
            let telemetry = env.telemetry(vehicle).ok_or(EnvError::UnknownVehicle(vehicle))?;
            let role = if i == 0 { Role::Leader } else { Role::Follower(i) };
            members.push(Vehicle {
                id: vehicle,
                role,
                platoon: id,
                telemetry,
            });
        }
        for member in members.iter().skip(1) {
            env.command_gap(member.id, config.inter_vehicle_distance)?;
        }
        debug!(
            "Built platoon {} with {} vehicles in lane {} (leader {})",
            id, self.count, self.lane, members[0].id
        );
        Ok(Platoon {
            id,
            members,
            desired_speed: self.desired_speed,
            route: self.route.clone(),
            lane: self.lane,
        })
    }
}

/// Ordered group of vehicles under one cooperative control policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Platoon {
    id: PlatoonId,
    members: Vec<Vehicle>,
    desired_speed: f64,
    route: String,
    lane: LaneIndex,
}

impl Platoon {
    pub fn id(&self) -> PlatoonId {
        self.id
    }

    /// Members in order, leader first.
    pub fn members(&self) -> &[Vehicle] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<VehicleId> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn leader(&self) -> &Vehicle {
        &self.members[0]
    }

    pub fn followers(&self) -> &[Vehicle] {
        &self.members[1..]
    }

    pub fn last(&self) -> &Vehicle {
        &self.members[self.members.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, id: VehicleId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    pub fn desired_speed(&self) -> f64 {
        self.desired_speed
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Lane the platoon cruises in when no maneuver is running.
    pub fn lane(&self) -> LaneIndex {
        self.lane
    }

    pub(crate) fn set_lane(&mut self, lane: LaneIndex) {
        self.lane = lane;
    }

    /// Front bumper of the leader to rear bumper of the last member (m).
    pub fn length(&self) -> f64 {
        self.leader().position() - self.last().telemetry.rear_position()
    }

    /// Longitudinal extent `(rear, front)` of the platoon.
    pub fn extent(&self) -> (f64, f64) {
        (self.last().telemetry.rear_position(), self.leader().position())
    }

    /// True if every member is centered in `lane`.
    pub fn all_in_lane(&self, lane: LaneIndex, tolerance: f64) -> bool {
        self.members
            .iter()
            .all(|m| m.lane() == lane && m.telemetry.is_centered(tolerance))
    }

    /// True if every member is within `tolerance` of the desired speed.
    pub fn at_desired_speed(&self, tolerance: f64) -> bool {
        self.members
            .iter()
            .all(|m| (m.speed() - self.desired_speed).abs() <= tolerance)
    }

    /// Mirrors the current telemetry of every member.
    ///
    /// Fails if a member vanished from the environment; the platoon keeps
    /// its last known state in that case.
    pub fn sync<E: TrafficEnvironment + ?Sized>(&mut self, env: &E) -> Result<(), EnvError> {
        let mut snapshots = Vec::with_capacity(self.members.len());
        for member in &self.members {
            snapshots.push(env.telemetry(member.id).ok_or(EnvError::UnknownVehicle(member.id))?);
        }
        for (member, telemetry) in self.members.iter_mut().zip(snapshots) {
            member.telemetry = telemetry;
        }
        Ok(())
    }
}
