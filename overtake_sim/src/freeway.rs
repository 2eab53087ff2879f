//! Ground truth traffic for simulation.
//!
//! The `Freeway` maintains the "God's eye view" of a straight multi-lane road:
//! - Longitudinal motion via the Intelligent Driver Model
//! - Lateral motion for commanded lane changes
//! - Collision bookkeeping
//!
//! It implements [`TrafficEnvironment`], so the coordinator drives it exactly
//! like it would drive an external traffic simulator.

use overtake_env::{
    neighbor_gap, Direction, EnvError, LaneIndex, Neighbor, Side, TrafficEnvironment, VehicleId, VehicleSpawn,
    VehicleTelemetry, VehicleType,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// IDM minimum bumper-to-bumper distance (m) for ordinary traffic.
const STANDSTILL_GAP: f64 = 2.0;

/// Time headway (s) of a vehicle that received a gap command.
const PLATOON_HEADWAY: f64 = 0.1;

/// Hard braking limit (m/s^2).
const MAX_BRAKE: f64 = 9.0;

/// Smallest gap used in the IDM interaction term.
const MIN_GAP: f64 = 0.1;

#[derive(Debug, Clone)]
struct FreewayVehicle {
    state: VehicleTelemetry,
    vehicle_type: VehicleType,
    route: String,
    desired_speed: f64,
    commanded_gap: Option<f64>,
    target_lane: Option<LaneIndex>,
}

impl FreewayVehicle {
    /// IDM acceleration given the free-road speed `v0` and the gap and speed
    /// of the vehicle ahead.
    fn idm_accel(&self, v0: f64, ahead: Option<(f64, f64)>) -> f64 {
        let a = self.vehicle_type.max_accel;
        let b = self.vehicle_type.comfort_decel;
        let v = self.state.speed;

        let free = if v0 > 0.0 { a * (1.0 - (v / v0).powi(4)) } else { -b };

        let (s0, headway) = match self.commanded_gap {
            Some(gap) => (gap, PLATOON_HEADWAY),
            None => (STANDSTILL_GAP, self.vehicle_type.headway_time),
        };
        let interaction = ahead
            .map(|(gap, v_ahead)| {
                let dynamic = v * headway + v * (v - v_ahead) / (2.0 * (a * b).sqrt());
                let s_star = s0 + dynamic.max(0.0);
                -a * (s_star / gap.max(MIN_GAP)).powi(2)
            })
            .unwrap_or(0.0);

        (free + interaction).clamp(-MAX_BRAKE, a)
    }

    /// Moves laterally toward the target lane. The lane index switches when
    /// the vehicle center crosses the marking.
    fn lateral_step(&mut self, dt: f64, lane_width: f64) {
        let Some(target) = self.target_lane else {
            return;
        };
        let lane = self.state.lane;
        let offset = self.state.lateral_offset;
        let step = self.state.max_lateral_speed * dt;

        if target == lane && offset.abs() <= step {
            self.state.lateral_offset = 0.0;
            self.target_lane = None;
            return;
        }
        let toward = if target > lane {
            1.0
        } else if target < lane {
            -1.0
        } else {
            -offset.signum()
        };

        let mut next = offset + toward * step;
        if next > lane_width / 2.0 {
            self.state.lane += 1;
            next -= lane_width;
        } else if next < -lane_width / 2.0 && self.state.lane > 0 {
            self.state.lane -= 1;
            next += lane_width;
        }
        self.state.lateral_offset = next;
    }
}

/// A straight freeway with per-lane speed limits.
pub struct Freeway {
    speed_limits: Vec<f64>,
    lane_width: f64,
    vehicles: BTreeMap<VehicleId, FreewayVehicle>,
    next_id: u32,
    collisions: u64,
    overlapping: BTreeSet<(VehicleId, VehicleId)>,
}

impl Freeway {
    /// Creates a road with one lane per entry of `speed_limits` (m/s),
    /// rightmost lane first.
    pub fn new(speed_limits: Vec<f64>, lane_width: f64) -> Self {
        Self {
            speed_limits,
            lane_width,
            vehicles: BTreeMap::new(),
            next_id: 0,
            collisions: 0,
            overlapping: BTreeSet::new(),
        }
    }

    /// Creates a road whose lanes all share one speed limit.
    pub fn uniform(lane_count: u8, speed_limit: f64, lane_width: f64) -> Self {
        Self::new(vec![speed_limit; lane_count as usize], lane_width)
    }

    pub fn lane_width(&self) -> f64 {
        self.lane_width
    }

    /// Number of collisions so far. A pair of vehicles that keeps
    /// overlapping counts once.
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// All vehicle ids in ascending order.
    pub fn vehicle_ids(&self) -> Vec<VehicleId> {
        self.vehicles.keys().copied().collect()
    }

    /// Telemetry of every vehicle in ascending id order.
    pub fn snapshot(&self) -> Vec<VehicleTelemetry> {
        self.vehicles.values().map(|v| v.state).collect()
    }

    /// Vehicle type name and route of a vehicle.
    pub fn describe(&self, id: VehicleId) -> Option<(&str, &str)> {
        self.vehicles
            .get(&id)
            .map(|v| (v.vehicle_type.name.as_str(), v.route.as_str()))
    }

    pub fn desired_speed(&self, id: VehicleId) -> Option<f64> {
        self.vehicles.get(&id).map(|v| v.desired_speed)
    }

    fn ahead_of(&self, me: &VehicleTelemetry) -> Option<(f64, f64)> {
        self.vehicles
            .values()
            .filter(|other| other.state.id != me.id && other.state.lane == me.lane)
            .filter_map(|other| neighbor_gap(me, &other.state, Side::Front).map(|gap| (gap, other.state.speed)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
    }

    /// Advances every vehicle by `dt` seconds.
    ///
    /// Accelerations are computed from one snapshot before any vehicle
    /// moves, so the result does not depend on iteration order.
    pub fn step(&mut self, dt: f64) {
        let accels: Vec<(VehicleId, f64)> = self
            .vehicles
            .values()
            .map(|v| {
                let v0 = v.desired_speed.min(self.lane_speed_limit(v.state.lane));
                (v.state.id, v.idm_accel(v0, self.ahead_of(&v.state)))
            })
            .collect();

        let lane_width = self.lane_width;
        for (id, accel) in accels {
            let Some(v) = self.vehicles.get_mut(&id) else {
                continue;
            };
            let speed = v.state.speed;
            let next = (speed + accel * dt).max(0.0);
            v.state.position += 0.5 * (speed + next) * dt;
            v.state.speed = next;
            v.lateral_step(dt, lane_width);
        }

        self.detect_collisions();
    }

    fn detect_collisions(&mut self) {
        let states = self.snapshot();
        let mut now_overlapping = BTreeSet::new();
        for (i, a) in states.iter().enumerate() {
            for b in &states[i + 1..] {
                let overlap = a.lane == b.lane && a.rear_position() < b.position && b.rear_position() < a.position;
                if overlap {
                    now_overlapping.insert((a.id, b.id));
                    if !self.overlapping.contains(&(a.id, b.id)) {
                        warn!("Collision between {} and {} in lane {}", a.id, b.id, a.lane);
                        self.collisions += 1;
                    }
                }
            }
        }
        self.overlapping = now_overlapping;
    }
}

impl TrafficEnvironment for Freeway {
    fn telemetry(&self, id: VehicleId) -> Option<VehicleTelemetry> {
        self.vehicles.get(&id).map(|v| v.state)
    }

    fn neighbors(&self, id: VehicleId, direction: Direction, side: Side, range: f64) -> Vec<Neighbor> {
        let Some(me) = self.vehicles.get(&id).map(|v| v.state) else {
            return Vec::new();
        };
        let Some(lane) = direction.apply(me.lane, self.lane_count()) else {
            return Vec::new();
        };
        let mut found: Vec<Neighbor> = self
            .vehicles
            .values()
            .filter(|other| other.state.id != id && other.state.lane == lane)
            .filter_map(|other| {
                neighbor_gap(&me, &other.state, side).map(|distance| Neighbor {
                    id: other.state.id,
                    distance,
                    speed: other.state.speed,
                })
            })
            .filter(|n| n.distance <= range)
            .collect();
        found.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        found
    }

    fn lane_count(&self) -> u8 {
        self.speed_limits.len() as u8
    }

    fn lane_speed_limit(&self, lane: LaneIndex) -> f64 {
        self.speed_limits.get(lane as usize).copied().unwrap_or(0.0)
    }

    fn spawn_vehicle(&mut self, spawn: VehicleSpawn) -> Result<VehicleId, EnvError> {
        if spawn.lane >= self.lane_count() {
            return Err(EnvError::LaneOutOfRange {
                lane: spawn.lane,
                lanes: self.lane_count(),
            });
        }
        if !spawn.speed.is_finite() || spawn.speed < 0.0 {
            return Err(EnvError::spawn(format!("invalid speed {}", spawn.speed)));
        }
        let rear = spawn.position - spawn.vehicle_type.length;
        let blocked = self
            .vehicles
            .values()
            .find(|v| v.state.lane == spawn.lane && v.state.rear_position() < spawn.position && rear < v.state.position);
        if let Some(v) = blocked {
            return Err(EnvError::spawn(format!(
                "{:.1} m in lane {} overlaps {}",
                spawn.position, spawn.lane, v.state.id
            )));
        }

        let id = VehicleId(self.next_id);
        self.next_id += 1;
        let state = VehicleTelemetry {
            id,
            lane: spawn.lane,
            position: spawn.position,
            speed: spawn.speed,
            lateral_offset: 0.0,
            length: spawn.vehicle_type.length,
            max_accel: spawn.vehicle_type.max_accel,
            max_lateral_speed: spawn.vehicle_type.max_lateral_speed,
            headway_time: spawn.vehicle_type.headway_time,
        };
        debug!(
            "Spawned {} ({}) at {:.1} m in lane {}",
            id, spawn.vehicle_type.name, spawn.position, spawn.lane
        );
        self.vehicles.insert(
            id,
            FreewayVehicle {
                state,
                desired_speed: spawn.speed,
                vehicle_type: spawn.vehicle_type,
                route: spawn.route,
                commanded_gap: None,
                target_lane: None,
            },
        );
        Ok(id)
    }

    fn command_lane_change(&mut self, id: VehicleId, target: LaneIndex) -> Result<(), EnvError> {
        let lanes = self.lane_count();
        if target >= lanes {
            return Err(EnvError::LaneOutOfRange { lane: target, lanes });
        }
        let v = self.vehicles.get_mut(&id).ok_or(EnvError::UnknownVehicle(id))?;
        if v.state.lane == target && v.state.lateral_offset == 0.0 {
            v.target_lane = None;
        } else {
            v.target_lane = Some(target);
        }
        Ok(())
    }

    fn command_gap(&mut self, id: VehicleId, gap: f64) -> Result<(), EnvError> {
        if !gap.is_finite() || gap < 0.0 {
            return Err(EnvError::command(format!("invalid gap {} for {}", gap, id)));
        }
        let v = self.vehicles.get_mut(&id).ok_or(EnvError::UnknownVehicle(id))?;
        v.commanded_gap = Some(gap);
        Ok(())
    }

    fn command_desired_speed(&mut self, id: VehicleId, speed: f64) -> Result<(), EnvError> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(EnvError::command(format!("invalid speed {} for {}", speed, id)));
        }
        let v = self.vehicles.get_mut(&id).ok_or(EnvError::UnknownVehicle(id))?;
        v.desired_speed = speed;
        Ok(())
    }
}
