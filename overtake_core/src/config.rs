//! Protocol configuration.
//!
//! All recognized options of the overtaking protocol, with the defaults of
//! the thesis/test setup. A configuration is validated once at setup; an
//! invalid configuration is fatal and never retried.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Shape of the random delivery delay drawn by the simulated channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayDistribution {
    /// Exponentially distributed, truncated to whole steps
    Exponential,
    /// Always the mean, rounded to whole steps
    Constant,
    /// Uniform over `0..=2 * mean` whole steps
    Uniform,
}

/// Configuration of the cooperative overtaking protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvertakingConfig {
    /// Speed deficit (m/s) of the leader versus its desired speed that triggers a decision
    pub min_overtaking_speed_delta: f64,

    /// Upper bound (s) for a whole attempt, measured from the trigger
    pub max_overtaking_time: f64,

    /// Mean channel delay in steps (0 = same-step delivery)
    pub mean_step_duration_msg_delivery: f64,

    /// Distribution of the channel delay
    pub delay_distribution: DelayDistribution,

    /// Probability that a message is silently dropped
    pub message_loss_probability: f64,

    /// Steps the decision phase waits for responses
    pub decision_timeout_steps: u64,

    /// Duration of one simulation step (s)
    pub step_length: f64,

    /// Radar range to the front (m)
    pub detection_range_front: f64,

    /// Radar range to the rear (m)
    pub detection_range_rear: f64,

    /// Radius around the platoon in which target-lane neighbors must respond (m)
    pub neighbor_radius: f64,

    /// Only overtake if the slower vehicle is nearer than this many platoon safety distances
    pub factor_safety_distance: f64,

    /// Relative raise of safety distances outside a lane change, against oscillation
    pub oscillation_mod: f64,

    /// Minimum gap (m) of a non-platooning truck
    pub truck_min_gap: f64,

    /// Time headway (s) of a non-platooning truck
    pub truck_headway: f64,

    /// Maximum length (m) of a vehicle to be overtaken
    pub truck_max_length: f64,

    /// Reaction time (s) of other drivers
    pub reaction_time: f64,

    /// Desired time gap (s) of other drivers
    pub time_gap: f64,

    /// Accepted deceleration (m/s^2) of the target-lane rear vehicle when moving left
    pub max_decel_entering: f64,

    /// Accepted deceleration (m/s^2) of the rear vehicle when returning right
    pub max_decel_returning: f64,

    /// Accepted deceleration (m/s^2) of the rear vehicle while already changing lanes
    pub max_decel_in_lane_change: f64,

    /// Lane width (m)
    pub lane_width: f64,

    /// Lateral distance (m) from the lane center that still counts as centered
    pub centering_tolerance: f64,

    /// Speed difference (m/s) to the desired speed that counts as settled
    pub speed_settle_tolerance: f64,

    /// Gap (m) platoon followers keep during the maneuver
    pub inter_vehicle_distance: f64,

    /// Steps the slower vehicle may be invisible before the lane change aborts
    pub max_not_detected: u32,

    /// Initial back-off exponent after a failed attempt (2^b steps)
    pub min_backoff: u32,

    /// Maximum back-off exponent
    pub max_backoff: u32,

    /// Time (s) to stay in the original lane after a completed maneuver
    pub stay_in_original_lane_time: f64,

    /// Return to the original lane after passing (false = stay in the overtaking lane)
    pub return_to_original_lane: bool,
}

impl Default for OvertakingConfig {
    fn default() -> Self {
        Self {
            min_overtaking_speed_delta: 2.7,
            max_overtaking_time: 45.0,
            mean_step_duration_msg_delivery: 0.0,
            delay_distribution: DelayDistribution::Exponential,
            message_loss_probability: 0.0,
            decision_timeout_steps: 20,
            step_length: 0.1,
            detection_range_front: 160.0,
            detection_range_rear: 80.0,
            neighbor_radius: 160.0,
            factor_safety_distance: 100.0,
            oscillation_mod: 0.01,
            truck_min_gap: 50.0,
            truck_headway: 1.8,
            truck_max_length: 18.75,
            reaction_time: 1.0,
            time_gap: 0.8,
            max_decel_entering: -1.0,
            max_decel_returning: 0.0,
            max_decel_in_lane_change: -3.5,
            lane_width: 3.2,
            centering_tolerance: 0.1,
            speed_settle_tolerance: 1.5,
            inter_vehicle_distance: 5.0,
            max_not_detected: 3,
            min_backoff: 5,
            max_backoff: 8,
            stay_in_original_lane_time: 10.0,
            return_to_original_lane: true,
        }
    }
}

impl OvertakingConfig {
    /// Parses and validates a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every option. Fails fast on the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [
            ("min_overtaking_speed_delta", self.min_overtaking_speed_delta),
            ("max_overtaking_time", self.max_overtaking_time),
            ("mean_step_duration_msg_delivery", self.mean_step_duration_msg_delivery),
            ("detection_range_front", self.detection_range_front),
            ("detection_range_rear", self.detection_range_rear),
            ("neighbor_radius", self.neighbor_radius),
            ("factor_safety_distance", self.factor_safety_distance),
            ("oscillation_mod", self.oscillation_mod),
            ("truck_min_gap", self.truck_min_gap),
            ("truck_headway", self.truck_headway),
            ("truck_max_length", self.truck_max_length),
            ("reaction_time", self.reaction_time),
            ("time_gap", self.time_gap),
            ("centering_tolerance", self.centering_tolerance),
            ("speed_settle_tolerance", self.speed_settle_tolerance),
            ("inter_vehicle_distance", self.inter_vehicle_distance),
            ("stay_in_original_lane_time", self.stay_in_original_lane_time),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(field, format!("must be finite and >= 0, got {}", value)));
            }
        }

        let non_positive = [
            ("max_decel_entering", self.max_decel_entering),
            ("max_decel_returning", self.max_decel_returning),
            ("max_decel_in_lane_change", self.max_decel_in_lane_change),
        ];
        for (field, value) in non_positive {
            if !value.is_finite() || value > 0.0 {
                return Err(ConfigError::invalid(field, format!("must be finite and <= 0, got {}", value)));
            }
        }

        if !(0.0..=1.0).contains(&self.message_loss_probability) {
            return Err(ConfigError::invalid(
                "message_loss_probability",
                format!("must be within [0, 1], got {}", self.message_loss_probability),
            ));
        }
        if !self.step_length.is_finite() || self.step_length <= 0.0 {
            return Err(ConfigError::invalid("step_length", format!("must be > 0, got {}", self.step_length)));
        }
        if !self.lane_width.is_finite() || self.lane_width <= 0.0 {
            return Err(ConfigError::invalid("lane_width", format!("must be > 0, got {}", self.lane_width)));
        }
        if self.decision_timeout_steps == 0 {
            return Err(ConfigError::invalid("decision_timeout_steps", "must be at least 1"));
        }
        if self.decision_timeout_steps >= self.max_overtaking_steps() {
            return Err(ConfigError::invalid(
                "decision_timeout_steps",
                format!(
                    "{} steps does not fit into max_overtaking_time ({} steps)",
                    self.decision_timeout_steps,
                    self.max_overtaking_steps()
                ),
            ));
        }
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "min_backoff",
                format!("{} exceeds max_backoff {}", self.min_backoff, self.max_backoff),
            ));
        }
        if self.max_backoff > 20 {
            return Err(ConfigError::invalid("max_backoff", format!("must be <= 20, got {}", self.max_backoff)));
        }
        Ok(())
    }

    /// Converts a duration in seconds to whole steps (rounded up).
    pub fn secs_to_steps(&self, secs: f64) -> u64 {
        // Tolerate float noise so that e.g. 45.0 / 0.1 maps to 450, not 451
        ((secs / self.step_length) - 1e-9).ceil().max(0.0) as u64
    }

    /// Converts a step count to seconds.
    pub fn steps_to_secs(&self, steps: u64) -> f64 {
        steps as f64 * self.step_length
    }

    /// The overtaking time cap in steps.
    pub fn max_overtaking_steps(&self) -> u64 {
        self.secs_to_steps(self.max_overtaking_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OvertakingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_overtaking_steps(), 450);
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let config = OvertakingConfig {
            min_overtaking_speed_delta: -1.0,
            ..Default::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "min_overtaking_speed_delta"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_loss_probability_bounds() {
        let config = OvertakingConfig {
            message_loss_probability: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OvertakingConfig {
            message_loss_probability: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_decision_timeout_must_fit_overtaking_time() {
        let config = OvertakingConfig {
            decision_timeout_steps: 450,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OvertakingConfig {
            decision_timeout_steps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_order() {
        let config = OvertakingConfig {
            min_backoff: 9,
            max_backoff: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = OvertakingConfig::from_json_str(
            r#"{ "min_overtaking_speed_delta": 0.1, "delay_distribution": "constant" }"#,
        )
        .unwrap();
        assert_eq!(config.min_overtaking_speed_delta, 0.1);
        assert_eq!(config.delay_distribution, DelayDistribution::Constant);
        assert_eq!(config.decision_timeout_steps, 20);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            OvertakingConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            OvertakingConfig::from_json_str(r#"{ "step_length": 0.0 }"#),
            Err(ConfigError::InvalidValue { field: "step_length", .. })
        ));
    }

    #[test]
    fn test_step_conversion() {
        let config = OvertakingConfig::default();
        assert_eq!(config.secs_to_steps(10.0), 100);
        assert_eq!(config.secs_to_steps(0.05), 1);
        assert!((config.steps_to_secs(25) - 2.5).abs() < 1e-9);
    }
}
