//! Freeway overtaking scenarios.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// OVT-001: Platoon passes a slow truck and returns
    SlowTruck,

    /// OVT-002: Speed deficit below the threshold, no attempt
    BelowThreshold,

    /// OVT-003: A neighbor in the overtaking lane refuses
    BlockedLane,

    /// OVT-004: Every message is lost
    RadioSilence,

    /// OVT-005: Exponentially delayed messages
    LaggyRadio,

    /// OVT-006: The truck speeds up and the time cap strikes
    TimeCap,

    /// OVT-007: Platoon stays in the overtaking lane
    StayLeft,

    /// OVT-008: Two platoons overtake independently
    TwinPlatoons,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SlowTruck,
            ScenarioId::BelowThreshold,
            ScenarioId::BlockedLane,
            ScenarioId::RadioSilence,
            ScenarioId::LaggyRadio,
            ScenarioId::TimeCap,
            ScenarioId::StayLeft,
            ScenarioId::TwinPlatoons,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SlowTruck => "slow_truck",
            ScenarioId::BelowThreshold => "below_threshold",
            ScenarioId::BlockedLane => "blocked_lane",
            ScenarioId::RadioSilence => "radio_silence",
            ScenarioId::LaggyRadio => "laggy_radio",
            ScenarioId::TimeCap => "time_cap",
            ScenarioId::StayLeft => "stay_left",
            ScenarioId::TwinPlatoons => "twin_platoons",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SlowTruck => "3-vehicle platoon at 120 km/h passes a truck at 80 km/h and returns",
            ScenarioId::BelowThreshold => "truck only 1.8 m/s slower than desired, the platoon follows it",
            ScenarioId::BlockedLane => "cooperative car in the left lane rejects every request",
            ScenarioId::RadioSilence => "100% message loss, decision times out after 20 steps",
            ScenarioId::LaggyRadio => "exponential delivery delay with a mean of 3 steps",
            ScenarioId::TimeCap => "truck accelerates once overtaken, 45 s cap aborts",
            ScenarioId::StayLeft => "platoon completes in the overtaking lane without returning",
            ScenarioId::TwinPlatoons => "two platoons 1 km apart, each behind its own truck",
        }
    }

    /// Shortest simulated time in which the scenario can be judged.
    pub fn minimum_duration_secs(&self) -> f64 {
        match self {
            ScenarioId::RadioSilence => 5.0,
            ScenarioId::BlockedLane => 20.0,
            ScenarioId::BelowThreshold => 30.0,
            ScenarioId::StayLeft => 40.0,
            ScenarioId::SlowTruck | ScenarioId::TwinPlatoons | ScenarioId::TimeCap => 50.0,
            ScenarioId::LaggyRadio => 60.0,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slow_truck" | "slowtruck" | "ovt-001" => Ok(ScenarioId::SlowTruck),
            "below_threshold" | "belowthreshold" | "ovt-002" => Ok(ScenarioId::BelowThreshold),
            "blocked_lane" | "blockedlane" | "ovt-003" => Ok(ScenarioId::BlockedLane),
            "radio_silence" | "radiosilence" | "ovt-004" => Ok(ScenarioId::RadioSilence),
            "laggy_radio" | "laggyradio" | "ovt-005" => Ok(ScenarioId::LaggyRadio),
            "time_cap" | "timecap" | "ovt-006" => Ok(ScenarioId::TimeCap),
            "stay_left" | "stayleft" | "ovt-007" => Ok(ScenarioId::StayLeft),
            "twin_platoons" | "twinplatoons" | "ovt-008" => Ok(ScenarioId::TwinPlatoons),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("OVT-004".parse::<ScenarioId>(), Ok(ScenarioId::RadioSilence));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
