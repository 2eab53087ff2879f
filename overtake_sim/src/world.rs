//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::error::SimError;
use crate::freeway::Freeway;

use overtake_core::{OvertakingConfig, OvertakingCoordinator, PlatoonId, PlatoonSpec, ResponsePolicy, SimChannel, Step};
use overtake_env::{LaneIndex, TrafficEnvironment, VehicleId, VehicleSpawn, VehicleType};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Seconds per simulation step
    pub step_length: f64,

    /// Simulated time in seconds
    pub duration_secs: f64,

    /// Number of lanes
    pub lane_count: u8,

    /// Speed limit of every lane (m/s)
    pub speed_limit: f64,

    /// Standard deviation of the desired speed of surrounding traffic (m/s)
    pub speed_noise_std: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            step_length: 0.1,
            duration_secs: 60.0,
            lane_count: 2,
            speed_limit: 36.1,
            speed_noise_std: 0.1,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.step_length.is_finite() && self.step_length > 0.0) {
            return Err(SimError::InvalidConfig(format!("step_length must be positive, got {}", self.step_length)));
        }
        if !(self.duration_secs.is_finite() && self.duration_secs >= 0.0) {
            return Err(SimError::InvalidConfig(format!("duration_secs must be non-negative, got {}", self.duration_secs)));
        }
        if self.lane_count == 0 {
            return Err(SimError::InvalidConfig("lane_count must be at least 1".to_string()));
        }
        if !(self.speed_limit.is_finite() && self.speed_limit > 0.0) {
            return Err(SimError::InvalidConfig(format!("speed_limit must be positive, got {}", self.speed_limit)));
        }
        if !(self.speed_noise_std.is_finite() && self.speed_noise_std >= 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "speed_noise_std must be non-negative, got {}",
                self.speed_noise_std
            )));
        }
        Ok(())
    }

    /// Number of steps covering `duration_secs`.
    pub fn total_steps(&self) -> Step {
        (self.duration_secs / self.step_length).round() as Step
    }
}

/// The SimWorld - freeway, coordinator and clock of one run.
pub struct SimWorld {
    config: SimConfig,
    context: SimContext,
    freeway: Freeway,
    coordinator: OvertakingCoordinator<SimChannel>,
    physics_rng: ChaCha8Rng,
    speed_noise: Option<Normal<f64>>,
}

impl SimWorld {
    /// Creates an empty road. The protocol step length follows the
    /// simulation step length.
    pub fn new(config: SimConfig, mut overtaking: OvertakingConfig) -> Result<Self, SimError> {
        config.validate()?;
        overtaking.step_length = config.step_length;

        let context = SimContext::new(config.seed, config.step_length);
        let channel = SimChannel::seeded(context.channel_seed(), &overtaking);
        let coordinator = OvertakingCoordinator::new(overtaking, channel)?;
        let freeway = Freeway::uniform(config.lane_count, config.speed_limit, coordinator.config().lane_width);

        let speed_noise = if config.speed_noise_std > 0.0 {
            Some(Normal::new(0.0, config.speed_noise_std).map_err(|e| SimError::InvalidConfig(e.to_string()))?)
        } else {
            None
        };

        Ok(Self {
            physics_rng: ChaCha8Rng::seed_from_u64(context.physics_seed()),
            config,
            context,
            freeway,
            coordinator,
            speed_noise,
        })
    }

    /// Spawns a platoon and registers it with the coordinator.
    pub fn spawn_platoon(&mut self, spec: &PlatoonSpec) -> Result<PlatoonId, SimError> {
        Ok(self.coordinator.build_platoon(&mut self.freeway, spec)?)
    }

    /// Spawns a vehicle of surrounding traffic. Its speed gets the
    /// configured noise.
    pub fn spawn_traffic(
        &mut self,
        vehicle_type: VehicleType,
        lane: LaneIndex,
        position: f64,
        speed: f64,
    ) -> Result<VehicleId, SimError> {
        let noise = self
            .speed_noise
            .as_ref()
            .map(|n| n.sample(&mut self.physics_rng))
            .unwrap_or(0.0);
        let id = self.freeway.spawn_vehicle(VehicleSpawn {
            vehicle_type,
            route: "freeway".to_string(),
            position,
            lane,
            speed: (speed + noise).max(0.0),
        })?;
        Ok(id)
    }

    /// Makes a surrounding vehicle answer overtaking requests.
    pub fn register_neighbor(&mut self, vehicle: VehicleId, policy: ResponsePolicy) -> Result<(), SimError> {
        Ok(self.coordinator.register_neighbor(vehicle, policy)?)
    }

    /// Advances physics by one step, then runs the protocol step.
    pub fn tick(&mut self) {
        self.freeway.step(self.config.step_length);
        let now = self.context.now();
        self.coordinator.overtaking_step(&mut self.freeway, now);
        self.context.advance();
        if now % 100 == 0 {
            debug!(
                "t={:.1}s | vehicles={} | attempts={} | collisions={}",
                self.context.time_secs(),
                self.freeway.vehicle_ids().len(),
                self.coordinator.records().len(),
                self.freeway.collisions()
            );
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn context(&self) -> &SimContext {
        &self.context
    }

    pub fn freeway(&self) -> &Freeway {
        &self.freeway
    }

    pub fn freeway_mut(&mut self) -> &mut Freeway {
        &mut self.freeway
    }

    pub fn coordinator(&self) -> &OvertakingCoordinator<SimChannel> {
        &self.coordinator
    }

    /// Next step to be executed.
    pub fn now(&self) -> Step {
        self.context.now()
    }

    pub fn time_secs(&self) -> f64 {
        self.context.time_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_world_tick() {
        let mut world = SimWorld::new(SimConfig::default(), OvertakingConfig::default()).unwrap();
        assert_eq!(world.now(), 0);

        world.tick();
        assert_eq!(world.now(), 1);
        assert!((world.time_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SimConfig {
            lane_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            SimWorld::new(config, OvertakingConfig::default()),
            Err(SimError::InvalidConfig(_))
        ));

        let bad_protocol = OvertakingConfig {
            message_loss_probability: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            SimWorld::new(SimConfig::default(), bad_protocol),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn test_step_length_follows_sim_config() {
        let config = SimConfig {
            step_length: 0.05,
            ..Default::default()
        };
        let world = SimWorld::new(config, OvertakingConfig::default()).unwrap();
        assert_eq!(world.coordinator().config().step_length, 0.05);
        assert_eq!(world.config().total_steps(), 1200);
    }

    #[test]
    fn test_sim_world_determinism() {
        let build = || {
            let mut world = SimWorld::new(SimConfig::default(), OvertakingConfig::default()).unwrap();
            world.spawn_traffic(VehicleType::truck(), 0, 200.0, 25.0).unwrap();
            world.spawn_traffic(VehicleType::passenger_car(), 1, 50.0, 33.0).unwrap();
            for _ in 0..100 {
                world.tick();
            }
            world.freeway().snapshot()
        };
        assert_eq!(build(), build());
    }
}
