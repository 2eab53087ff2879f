//! JSON exporter for offline inspection of a run.
//!
//! Exports vehicle positions and protocol events frame by frame.

use crate::error::SimError;
use crate::world::SimWorld;
use overtake_core::{AttemptRecord, Step};
use overtake_env::VehicleTelemetry;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    pub step: Step,

    /// Ground truth of every vehicle
    pub vehicles: Vec<VehicleFrame>,

    /// Protocol events since the previous frame
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

impl SimFrame {
    /// Captures the current state of `world`.
    pub fn capture(world: &SimWorld, events: Vec<SimEvent>) -> Self {
        Self {
            time_sec: world.time_secs(),
            step: world.now(),
            vehicles: world.freeway().snapshot().iter().map(VehicleFrame::from).collect(),
            events,
        }
    }
}

/// Position of a vehicle.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleFrame {
    pub id: u32,
    pub lane: u8,
    pub position: f64,
    pub speed: f64,
    pub lateral_offset: f64,
}

impl From<&VehicleTelemetry> for VehicleFrame {
    fn from(t: &VehicleTelemetry) -> Self {
        Self {
            id: t.id.0,
            lane: t.lane,
            position: t.position,
            speed: t.speed,
            lateral_offset: t.lateral_offset,
        }
    }
}

/// Simulation event.
#[derive(Debug, Clone, Serialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Archived attempts of the run
    pub attempts: Vec<AttemptRecord>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            attempts: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, attempts: Vec<AttemptRecord>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.attempts = attempts;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SimConfig;
    use overtake_core::OvertakingConfig;
    use overtake_env::VehicleType;

    #[test]
    fn test_export_frames() {
        let mut world = SimWorld::new(SimConfig::default(), OvertakingConfig::default()).unwrap();
        world.spawn_traffic(VehicleType::truck(), 0, 100.0, 25.0).unwrap();
        world.tick();

        let mut export = SimExport::new("slow_truck", 42);
        export.add_frame(SimFrame::capture(&world, vec![SimEvent::info("start")]));
        export.finalize(true, None, Vec::new());
        assert!((export.duration_sec - 0.1).abs() < 1e-9);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["frames"][0]["vehicles"][0]["lane"], 0);
        assert_eq!(json["frames"][0]["events"][0]["message"], "start");
        assert!(json.get("failure_reason").is_none());
    }

    #[test]
    fn test_write_to_file() {
        let path = std::env::temp_dir().join("overtake_sim_export_test.json");
        let export = SimExport::new("below_threshold", 7);
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("below_threshold"));
        let _ = std::fs::remove_file(&path);
    }
}
