//! Scripted in-memory traffic environment for tests.

use crate::error::EnvError;
use crate::traffic::{neighbor_gap, TrafficEnvironment};
use crate::types::{Direction, LaneIndex, Neighbor, Side, VehicleId, VehicleSpawn, VehicleTelemetry};
use std::collections::BTreeMap;

/// An actuation request recorded by [`StubTraffic`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    LaneChange { id: VehicleId, target: LaneIndex },
    Gap { id: VehicleId, gap: f64 },
    DesiredSpeed { id: VehicleId, speed: f64 },
}

/// Stub environment with frozen physics.
///
/// Vehicles only move when a test moves them. Lane-change commands are
/// logged and either applied immediately or held back until
/// [`apply_pending`](Self::apply_pending) is called, which lets tests
/// observe the order in which commands are issued.
pub struct StubTraffic {
    lane_count: u8,
    speed_limit: f64,
    vehicles: BTreeMap<VehicleId, VehicleTelemetry>,
    commands: Vec<Command>,
    pending: Vec<(VehicleId, LaneIndex)>,
    instant_lane_changes: bool,
    next_id: u32,
}

impl StubTraffic {
    /// Creates an empty road with `lane_count` lanes.
    pub fn new(lane_count: u8, speed_limit: f64) -> Self {
        Self {
            lane_count,
            speed_limit,
            vehicles: BTreeMap::new(),
            commands: Vec::new(),
            pending: Vec::new(),
            instant_lane_changes: false,
            next_id: 0,
        }
    }

    /// Applies lane-change commands as soon as they are issued.
    pub fn with_instant_lane_changes(mut self) -> Self {
        self.instant_lane_changes = true;
        self
    }

    /// Completes all held-back lane changes.
    pub fn apply_pending(&mut self) {
        for (id, target) in std::mem::take(&mut self.pending) {
            if let Some(v) = self.vehicles.get_mut(&id) {
                v.lane = target;
                v.lateral_offset = 0.0;
            }
        }
    }

    /// Returns the held-back lane changes.
    pub fn pending(&self) -> &[(VehicleId, LaneIndex)] {
        &self.pending
    }

    /// All commands received so far, in order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Vehicles that received a lane-change command, in command order.
    pub fn lane_change_order(&self) -> Vec<VehicleId> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::LaneChange { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Forgets the command log.
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Sets the speed of a vehicle.
    pub fn set_speed(&mut self, id: VehicleId, speed: f64) {
        if let Some(v) = self.vehicles.get_mut(&id) {
            v.speed = speed;
        }
    }

    /// Moves a vehicle to a new longitudinal position.
    pub fn set_position(&mut self, id: VehicleId, position: f64) {
        if let Some(v) = self.vehicles.get_mut(&id) {
            v.position = position;
        }
    }

    /// Puts a vehicle into a lane (centered).
    pub fn set_lane(&mut self, id: VehicleId, lane: LaneIndex) {
        if let Some(v) = self.vehicles.get_mut(&id) {
            v.lane = lane;
            v.lateral_offset = 0.0;
        }
    }

    /// Sets the lateral offset of a vehicle.
    pub fn set_lateral_offset(&mut self, id: VehicleId, offset: f64) {
        if let Some(v) = self.vehicles.get_mut(&id) {
            v.lateral_offset = offset;
        }
    }

    /// Removes a vehicle from the road.
    pub fn remove(&mut self, id: VehicleId) {
        self.vehicles.remove(&id);
    }
}

impl TrafficEnvironment for StubTraffic {
    fn telemetry(&self, id: VehicleId) -> Option<VehicleTelemetry> {
        self.vehicles.get(&id).copied()
    }

    fn neighbors(&self, id: VehicleId, direction: Direction, side: Side, range: f64) -> Vec<Neighbor> {
        let Some(me) = self.vehicles.get(&id) else {
            return Vec::new();
        };
        let Some(lane) = direction.apply(me.lane, self.lane_count) else {
            return Vec::new();
        };
        let mut found: Vec<Neighbor> = self
            .vehicles
            .values()
            .filter(|other| other.id != id && other.lane == lane)
            .filter_map(|other| {
                neighbor_gap(me, other, side).map(|distance| Neighbor {
                    id: other.id,
                    distance,
                    speed: other.speed,
                })
            })
            .filter(|n| n.distance <= range)
            .collect();
        found.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        found
    }

    fn lane_count(&self) -> u8 {
        self.lane_count
    }

    fn lane_speed_limit(&self, _lane: LaneIndex) -> f64 {
        self.speed_limit
    }

    fn spawn_vehicle(&mut self, spawn: VehicleSpawn) -> Result<VehicleId, EnvError> {
        if spawn.lane >= self.lane_count {
            return Err(EnvError::LaneOutOfRange {
                lane: spawn.lane,
                lanes: self.lane_count,
            });
        }
        let id = VehicleId(self.next_id);
        self.next_id += 1;
        self.vehicles.insert(
            id,
            VehicleTelemetry {
                id,
                lane: spawn.lane,
                position: spawn.position,
                speed: spawn.speed,
                lateral_offset: 0.0,
                length: spawn.vehicle_type.length,
                max_accel: spawn.vehicle_type.max_accel,
                max_lateral_speed: spawn.vehicle_type.max_lateral_speed,
                headway_time: spawn.vehicle_type.headway_time,
            },
        );
        Ok(id)
    }

    fn command_lane_change(&mut self, id: VehicleId, target: LaneIndex) -> Result<(), EnvError> {
        if !self.vehicles.contains_key(&id) {
            return Err(EnvError::UnknownVehicle(id));
        }
        if target >= self.lane_count {
            return Err(EnvError::LaneOutOfRange {
                lane: target,
                lanes: self.lane_count,
            });
        }
        self.commands.push(Command::LaneChange { id, target });
        if self.instant_lane_changes {
            self.set_lane(id, target);
        } else {
            self.pending.retain(|(pid, _)| *pid != id);
            self.pending.push((id, target));
        }
        Ok(())
    }

    fn command_gap(&mut self, id: VehicleId, gap: f64) -> Result<(), EnvError> {
        if !self.vehicles.contains_key(&id) {
            return Err(EnvError::UnknownVehicle(id));
        }
        self.commands.push(Command::Gap { id, gap });
        Ok(())
    }

    fn command_desired_speed(&mut self, id: VehicleId, speed: f64) -> Result<(), EnvError> {
        if !self.vehicles.contains_key(&id) {
            return Err(EnvError::UnknownVehicle(id));
        }
        self.commands.push(Command::DesiredSpeed { id, speed });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VehicleType;

    fn spawn(env: &mut StubTraffic, lane: LaneIndex, position: f64, speed: f64) -> VehicleId {
        env.spawn_vehicle(VehicleSpawn {
            vehicle_type: VehicleType::platoon_car(),
            route: "freeway".to_string(),
            position,
            lane,
            speed,
        })
        .unwrap()
    }

    #[test]
    fn test_neighbors_sorted_by_gap() {
        let mut env = StubTraffic::new(2, 36.0);
        let me = spawn(&mut env, 0, 100.0, 30.0);
        let far = spawn(&mut env, 1, 180.0, 30.0);
        let near = spawn(&mut env, 1, 120.0, 30.0);
        let behind = spawn(&mut env, 1, 50.0, 30.0);

        let front = env.neighbors(me, Direction::Left, Side::Front, 200.0);
        assert_eq!(front.iter().map(|n| n.id).collect::<Vec<_>>(), vec![near, far]);
        assert_eq!(front[0].distance, 16.0);

        let rear = env.neighbors(me, Direction::Left, Side::Rear, 200.0);
        assert_eq!(rear.len(), 1);
        assert_eq!(rear[0].id, behind);
        assert_eq!(rear[0].distance, 46.0);
    }

    #[test]
    fn test_neighbors_respect_range_and_road_edge() {
        let mut env = StubTraffic::new(2, 36.0);
        let me = spawn(&mut env, 0, 100.0, 30.0);
        spawn(&mut env, 1, 400.0, 30.0);

        assert!(env.neighbors(me, Direction::Left, Side::Front, 160.0).is_empty());
        assert!(env.neighbors(me, Direction::Right, Side::Front, 1000.0).is_empty());
    }

    #[test]
    fn test_deferred_lane_change() {
        let mut env = StubTraffic::new(2, 36.0);
        let me = spawn(&mut env, 0, 100.0, 30.0);

        env.command_lane_change(me, 1).unwrap();
        assert_eq!(env.telemetry(me).unwrap().lane, 0);
        assert_eq!(env.pending(), &[(me, 1)]);

        env.apply_pending();
        assert_eq!(env.telemetry(me).unwrap().lane, 1);
        assert_eq!(env.lane_change_order(), vec![me]);
    }

    #[test]
    fn test_instant_lane_change_and_unknown_vehicle() {
        let mut env = StubTraffic::new(2, 36.0).with_instant_lane_changes();
        let me = spawn(&mut env, 0, 100.0, 30.0);

        env.command_lane_change(me, 1).unwrap();
        assert_eq!(env.telemetry(me).unwrap().lane, 1);

        assert_eq!(
            env.command_lane_change(VehicleId(99), 1),
            Err(EnvError::UnknownVehicle(VehicleId(99)))
        );
        assert!(matches!(
            env.command_lane_change(me, 5),
            Err(EnvError::LaneOutOfRange { lane: 5, lanes: 2 })
        ));
    }
}
