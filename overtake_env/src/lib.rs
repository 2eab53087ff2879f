//! Overtake Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam between the cooperative overtaking
//! protocol and whatever moves the vehicles: a microscopic traffic simulator,
//! a vehicle-in-the-loop bench, or a scripted stub in unit tests.
//!
//! # Core Concept
//!
//! The protocol engine never owns physics. It reads telemetry and issues
//! actuation commands through [`TrafficEnvironment`]:
//! - Telemetry (`telemetry()`, `neighbors()`)
//! - Actuation (`command_lane_change()`, `command_gap()`, `command_desired_speed()`)
//! - Construction (`spawn_vehicle()`)
//!
//! # Example
//!
//! ```ignore
//! use overtake_env::{TrafficEnvironment, Direction, Side};
//!
//! fn front_gap<E: TrafficEnvironment>(env: &E, id: VehicleId) -> Option<f64> {
//!     env.nearest(id, Direction::Same, Side::Front, 160.0).map(|n| n.distance)
//! }
//! ```

mod error;
mod stub;
mod traffic;
mod types;

pub use error::EnvError;
pub use stub::{Command, StubTraffic};
pub use traffic::{neighbor_gap, TrafficEnvironment};
pub use types::{
    Direction, LaneIndex, Neighbor, Side, VehicleId, VehicleSpawn, VehicleTelemetry, VehicleType,
};
