//! Traffic environment abstraction consumed by the overtaking protocol.

use crate::error::EnvError;
use crate::types::{Direction, LaneIndex, Neighbor, Side, VehicleId, VehicleSpawn, VehicleTelemetry};

/// The external vehicle-dynamics simulator and platoon controller.
///
/// The protocol engine only reads physical state through this trait and
/// issues actuation requests through it. All calls are synchronous and are
/// assumed to take effect by the next simulation tick.
///
/// # Implementations
///
/// - **Simulation**: `overtake_sim::Freeway` - IDM traffic on a straight freeway
/// - **Tests**: [`StubTraffic`](crate::StubTraffic) - scripted telemetry and a command log
///
/// # Command Flow
///
/// ```text
/// Coordinator                  Environment
///   |                              |
///   |-- telemetry(id) ------------>|
///   |<-------------- snapshot -----|
///   |-- command_lane_change ------>|
///   |                              |-- [next tick: lateral motion]
/// ```
pub trait TrafficEnvironment {
    /// Returns the current physical state of a vehicle.
    fn telemetry(&self, id: VehicleId) -> Option<VehicleTelemetry>;

    /// Returns the vehicles on the `direction` lane relative to `id` that are
    /// on the given `side` within `range` meters, ordered by increasing gap.
    ///
    /// The reference vehicle itself is never part of the result.
    fn neighbors(&self, id: VehicleId, direction: Direction, side: Side, range: f64) -> Vec<Neighbor>;

    /// Number of lanes of the road.
    fn lane_count(&self) -> u8;

    /// Speed limit of a lane in m/s.
    fn lane_speed_limit(&self, lane: LaneIndex) -> f64;

    /// Inserts a vehicle and returns its id.
    fn spawn_vehicle(&mut self, spawn: VehicleSpawn) -> Result<VehicleId, EnvError>;

    /// Orders a vehicle to move laterally into `target` lane.
    fn command_lane_change(&mut self, id: VehicleId, target: LaneIndex) -> Result<(), EnvError>;

    /// Orders a vehicle to keep `gap` meters to its predecessor.
    fn command_gap(&mut self, id: VehicleId, gap: f64) -> Result<(), EnvError>;

    /// Orders a vehicle to cruise at `speed` m/s when unobstructed.
    fn command_desired_speed(&mut self, id: VehicleId, speed: f64) -> Result<(), EnvError>;

    /// Returns the nearest neighbor on a side, if any.
    fn nearest(&self, id: VehicleId, direction: Direction, side: Side, range: f64) -> Option<Neighbor> {
        self.neighbors(id, direction, side, range).into_iter().next()
    }
}

/// Bumper-to-bumper gap from `reference` to `other` if `other` lies on `side`.
///
/// A vehicle whose front bumper is ahead of the reference's front bumper is
/// in front; overlapping vehicles report a gap of zero.
pub fn neighbor_gap(reference: &VehicleTelemetry, other: &VehicleTelemetry, side: Side) -> Option<f64> {
    let ahead = other.position > reference.position
        || (other.position == reference.position && other.id > reference.id);
    match (side, ahead) {
        (Side::Front, true) => Some((other.rear_position() - reference.position).max(0.0)),
        (Side::Rear, false) => Some((reference.rear_position() - other.position).max(0.0)),
        _ => None,
    }
}
