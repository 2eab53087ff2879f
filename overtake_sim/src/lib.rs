//! Overtake Deterministic Simulation Harness
//!
//! This crate provides a controlled freeway on which the overtaking protocol
//! runs deterministically.
//!
//! # Core Principle
//!
//! All sources of non-determinism are derived from a single 64-bit seed:
//! - **Time**: a step counter advanced only by [`SimWorld::tick`]
//! - **Radio**: the V2V channel draws delay and loss from its own stream
//! - **Traffic**: speed noise of surrounding vehicles from the physics stream
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      SimWorld                        │
//! │  ┌───────────────┐   tick()   ┌───────────────────┐  │
//! │  │    Freeway    │◄──────────►│ OvertakingCoord.  │  │
//! │  │ (IDM physics) │ Traffic-   │  + SimChannel     │  │
//! │  └───────────────┘ Environment└───────────────────┘  │
//! │          ▲                                           │
//! │  ┌───────┴───────┐                                   │
//! │  │  SimContext   │  (clock + seed derivation)        │
//! │  └───────────────┘                                   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use overtake_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::SlowTruck);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod freeway;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use error::SimError;
pub use exporter::{SimEvent, SimExport, SimFrame, VehicleFrame};
pub use freeway::Freeway;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld};
