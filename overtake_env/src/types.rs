//! Common types shared by the protocol engine and the traffic environment.

use serde::{Deserialize, Serialize};

/// Index of a lane counted from the rightmost lane (0).
pub type LaneIndex = u8;

/// Unique identifier for a vehicle in the traffic environment.
///
/// Issued by the environment when a vehicle is spawned and stable for the
/// lifetime of that vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VehicleId(pub u32);

impl VehicleId {
    /// Creates a VehicleId from a raw index.
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lateral direction of a maneuver, relative to the vehicle's current lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
    Same,
}

impl Direction {
    /// Lane index delta of this direction (left = towards higher indices).
    pub fn lane_delta(&self) -> i16 {
        match self {
            Direction::Left => 1,
            Direction::Right => -1,
            Direction::Same => 0,
        }
    }

    /// Returns the opposite direction. `Same` stays `Same`.
    pub fn flip(&self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
            Direction::Same => Direction::Same,
        }
    }

    /// One-letter tag used in log lines ("L", "R", "S").
    pub fn short(&self) -> &'static str {
        match self {
            Direction::Left => "L",
            Direction::Right => "R",
            Direction::Same => "S",
        }
    }

    /// Applies this direction to `lane`, returning `None` if the resulting
    /// lane does not exist on a road with `lane_count` lanes.
    pub fn apply(&self, lane: LaneIndex, lane_count: u8) -> Option<LaneIndex> {
        let target = lane as i16 + self.lane_delta();
        if target < 0 || target >= lane_count as i16 {
            None
        } else {
            Some(target as LaneIndex)
        }
    }

    /// Direction that leads from lane `from` to lane `to`.
    pub fn between(from: LaneIndex, to: LaneIndex) -> Self {
        match to.cmp(&from) {
            std::cmp::Ordering::Greater => Direction::Left,
            std::cmp::Ordering::Less => Direction::Right,
            std::cmp::Ordering::Equal => Direction::Same,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Direction::Left => "left",
            Direction::Right => "right",
            Direction::Same => "same",
        };
        write!(f, "{}", name)
    }
}

/// Longitudinal side relative to a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Front,
    Rear,
}

/// Static properties of a vehicle class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleType {
    /// Type name (e.g. "PlatoonCar", "Truck")
    pub name: String,

    /// Vehicle length in meters
    pub length: f64,

    /// Maximum longitudinal acceleration in m/s^2
    pub max_accel: f64,

    /// Comfortable deceleration in m/s^2 (positive value)
    pub comfort_decel: f64,

    /// Maximum lateral speed in m/s during a lane change
    pub max_lateral_speed: f64,

    /// Desired time headway in seconds
    pub headway_time: f64,
}

impl VehicleType {
    /// Passenger car used for platoon members.
    pub fn platoon_car() -> Self {
        Self {
            name: "PlatoonCar".to_string(),
            length: 4.0,
            max_accel: 2.5,
            comfort_decel: 4.5,
            max_lateral_speed: 1.0,
            headway_time: 1.0,
        }
    }

    /// Heavy truck, the usual vehicle to be overtaken.
    pub fn truck() -> Self {
        Self {
            name: "Truck".to_string(),
            length: 18.75,
            max_accel: 1.0,
            comfort_decel: 3.0,
            max_lateral_speed: 0.8,
            headway_time: 1.8,
        }
    }

    /// Ordinary passenger car of surrounding traffic.
    pub fn passenger_car() -> Self {
        Self {
            name: "Car".to_string(),
            length: 4.5,
            max_accel: 2.6,
            comfort_decel: 4.5,
            max_lateral_speed: 1.0,
            headway_time: 1.2,
        }
    }
}

/// Request to insert a vehicle into the traffic environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSpawn {
    /// Vehicle class
    pub vehicle_type: VehicleType,

    /// Route the vehicle follows
    pub route: String,

    /// Longitudinal position of the front bumper in meters
    pub position: f64,

    /// Lane to insert the vehicle into
    pub lane: LaneIndex,

    /// Initial and desired speed in m/s
    pub speed: f64,
}

/// Snapshot of a vehicle's physical state as reported by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleTelemetry {
    /// Vehicle this snapshot belongs to
    pub id: VehicleId,

    /// Lane the vehicle's center currently occupies
    pub lane: LaneIndex,

    /// Longitudinal position of the front bumper in meters
    pub position: f64,

    /// Longitudinal speed in m/s
    pub speed: f64,

    /// Lateral offset from the center of `lane` in meters (positive = left)
    pub lateral_offset: f64,

    /// Vehicle length in meters
    pub length: f64,

    /// Maximum longitudinal acceleration in m/s^2
    pub max_accel: f64,

    /// Maximum lateral speed in m/s
    pub max_lateral_speed: f64,

    /// Desired time headway in seconds
    pub headway_time: f64,
}

impl VehicleTelemetry {
    /// Longitudinal position of the rear bumper.
    pub fn rear_position(&self) -> f64 {
        self.position - self.length
    }

    /// Returns true if the vehicle sits within `tolerance` meters of its lane center.
    pub fn is_centered(&self, tolerance: f64) -> bool {
        self.lateral_offset.abs() <= tolerance
    }
}

/// A nearby vehicle as seen from a reference vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Neighbor vehicle
    pub id: VehicleId,

    /// Bumper-to-bumper gap in meters (never negative)
    pub distance: f64,

    /// Neighbor speed in m/s
    pub speed: f64,
}
