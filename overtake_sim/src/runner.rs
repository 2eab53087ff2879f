//! Scenario runner - executes freeway overtaking scenarios.

use crate::error::SimError;
use crate::exporter::{SimEvent, SimExport, SimFrame};
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use overtake_core::{
    AbortReason, AttemptRecord, DelayDistribution, Outcome, OvertakingConfig, PlatoonId, PlatoonSpec, RejectCause,
    RejectionReason, ResponsePolicy,
};
use overtake_env::{TrafficEnvironment, VehicleId, VehicleType};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Desired platoon speed (120 km/h).
const PLATOON_SPEED: f64 = 33.33;

/// Truck speed (80 km/h).
const TRUCK_SPEED: f64 = 22.22;

/// Gap between the platoon leader and the truck at spawn.
const TRUCK_GAP: f64 = 120.0;

const PLATOON_SIZE: usize = 3;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total steps executed
    pub total_steps: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Archived attempts
    pub attempts: Vec<AttemptRecord>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub attempts: usize,
    pub completed: usize,
    pub rejected: usize,
    pub aborted: usize,

    /// Channel counters
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub messages_delivered: u64,

    pub collisions: u64,

    /// Longest archived attempt (s)
    pub longest_attempt_secs: f64,
}

/// Vehicles a scenario placed on the road.
#[derive(Debug, Default)]
struct Cast {
    platoons: Vec<PlatoonId>,
    trucks: Vec<VehicleId>,
    neighbors: Vec<VehicleId>,
}

/// Runs overtaking scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Protocol configuration the scenarios start from
    overtaking: OvertakingConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_duration_secs: 60.0,
            overtaking: OvertakingConfig::default(),
        }
    }

    /// Sets the maximum duration. Scenarios never run shorter than their
    /// own minimum.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the base protocol configuration.
    pub fn with_overtaking(mut self, config: OvertakingConfig) -> Self {
        self.overtaking = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario and records a frame every `interval` steps.
    pub fn run_with_export(&self, scenario: ScenarioId, interval: u64) -> (ScenarioResult, SimExport) {
        let mut export = SimExport::new(scenario.name(), self.seed);
        let result = self.execute(scenario, Some((&mut export, interval.max(1))));
        export.finalize(result.passed, result.failure_reason.clone(), result.attempts.clone());
        (result, export)
    }

    fn protocol_config(&self, scenario: ScenarioId) -> OvertakingConfig {
        let mut config = self.overtaking.clone();
        match scenario {
            ScenarioId::RadioSilence => config.message_loss_probability = 1.0,
            ScenarioId::LaggyRadio => {
                config.mean_step_duration_msg_delivery = 3.0;
                config.delay_distribution = DelayDistribution::Exponential;
            }
            ScenarioId::StayLeft => config.return_to_original_lane = false,
            _ => {}
        }
        config
    }

    fn setup(&self, scenario: ScenarioId) -> Result<(SimWorld, Cast), SimError> {
        let sim = SimConfig {
            seed: self.seed,
            duration_secs: self.max_duration_secs.max(scenario.minimum_duration_secs()),
            ..Default::default()
        };
        let mut world = SimWorld::new(sim, self.protocol_config(scenario))?;
        let mut cast = Cast::default();

        let truck_speed = match scenario {
            ScenarioId::BelowThreshold => PLATOON_SPEED - 1.8,
            _ => TRUCK_SPEED,
        };
        let starts: &[f64] = match scenario {
            ScenarioId::TwinPlatoons => &[0.0, 1000.0],
            _ => &[0.0],
        };

        for start in starts {
            let platoon = world.spawn_platoon(&PlatoonSpec {
                count: PLATOON_SIZE,
                desired_speed: PLATOON_SPEED,
                vehicle_type: VehicleType::platoon_car(),
                route: "freeway".to_string(),
                start_position: *start,
                lane: 0,
            })?;
            let front = world
                .coordinator()
                .platoon(platoon)
                .map(|p| p.leader().position())
                .unwrap_or(*start);
            let truck_type = VehicleType::truck();
            let truck_front = front + TRUCK_GAP + truck_type.length;
            let truck = world.spawn_traffic(truck_type, 0, truck_front, truck_speed)?;

            if scenario == ScenarioId::BlockedLane {
                // Rides next to the truck in the overtaking lane
                let car = world.spawn_traffic(VehicleType::passenger_car(), 1, truck_front, truck_speed)?;
                world.register_neighbor(car, ResponsePolicy::AlwaysReject)?;
                cast.neighbors.push(car);
            }
            cast.platoons.push(platoon);
            cast.trucks.push(truck);
        }
        Ok((world, cast))
    }

    fn execute(&self, scenario: ScenarioId, mut export: Option<(&mut SimExport, u64)>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("{}", scenario.description());

        let (mut world, cast) = match self.setup(scenario) {
            Ok(setup) => setup,
            Err(e) => {
                warn!("Scenario {} setup failed: {}", scenario.name(), e);
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_steps: 0,
                    final_time_secs: 0.0,
                    failure_reason: Some(format!("Setup failed: {}", e)),
                    metrics: ScenarioMetrics::default(),
                    attempts: Vec::new(),
                };
            }
        };

        let total_steps = world.config().total_steps();
        let mut truck_sped_up = false;
        let mut seen_records = 0;
        let mut seen_active = 0;
        let mut events = Vec::new();

        for _ in 0..total_steps {
            if scenario == ScenarioId::TimeCap && !truck_sped_up && world.coordinator().attempts().count() > 0 {
                // The truck refuses to be overtaken
                for truck in &cast.trucks {
                    if let Err(e) = world.freeway_mut().command_desired_speed(*truck, PLATOON_SPEED + 0.7) {
                        warn!("Truck {} ignored speed command: {}", truck, e);
                    }
                }
                events.push(SimEvent::warn("truck accelerates"));
                truck_sped_up = true;
            }

            world.tick();

            let active = world.coordinator().attempts().count();
            if active > seen_active {
                events.push(SimEvent::info(format!("{} attempt(s) running", active)));
            }
            seen_active = active;
            let records = world.coordinator().records();
            for record in &records[seen_records..] {
                events.push(SimEvent::info(format!(
                    "attempt {} of {} {} after {:.1}s",
                    record.id, record.platoon, record.outcome, record.duration_secs
                )));
            }
            seen_records = records.len();

            if let Some((export, interval)) = export.as_mut() {
                if (world.now() - 1) % *interval == 0 {
                    export.add_frame(SimFrame::capture(&world, std::mem::take(&mut events)));
                }
            }
        }

        let attempts = world.coordinator().records().to_vec();
        let metrics = Self::collect_metrics(&world, &attempts);
        let verdict = Self::evaluate(scenario, &world, &cast, &attempts)
            .and_then(|_| Self::check_time_cap(&world, &attempts));

        if let Err(reason) = &verdict {
            warn!("Scenario {} failed: {}", scenario.name(), reason);
        }
        info!(
            "Scenario {} finished: {} attempts, {} completed, {} collisions",
            scenario.name(),
            metrics.attempts,
            metrics.completed,
            metrics.collisions
        );

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: verdict.is_ok(),
            total_steps,
            final_time_secs: world.time_secs(),
            failure_reason: verdict.err(),
            metrics,
            attempts,
        }
    }

    fn collect_metrics(world: &SimWorld, attempts: &[AttemptRecord]) -> ScenarioMetrics {
        let stats = world.coordinator().channel_stats();
        let count = |outcome: Outcome| attempts.iter().filter(|r| r.outcome == outcome).count();
        ScenarioMetrics {
            attempts: attempts.len(),
            completed: count(Outcome::Completed),
            rejected: count(Outcome::Rejected),
            aborted: count(Outcome::Aborted),
            messages_sent: stats.sent,
            messages_dropped: stats.dropped,
            messages_delivered: stats.delivered,
            collisions: world.freeway().collisions(),
            longest_attempt_secs: attempts.iter().map(|r| r.duration_secs).fold(0.0, f64::max),
        }
    }

    /// No attempt may outlive the overtaking time cap.
    fn check_time_cap(world: &SimWorld, attempts: &[AttemptRecord]) -> Result<(), String> {
        let cap = world.coordinator().config().max_overtaking_steps();
        match attempts.iter().find(|r| r.ended_at - r.triggered_at > cap) {
            Some(r) => Err(format!("Attempt {} ran {} steps, cap is {}", r.id, r.ended_at - r.triggered_at, cap)),
            None => Ok(()),
        }
    }

    fn evaluate(scenario: ScenarioId, world: &SimWorld, cast: &Cast, attempts: &[AttemptRecord]) -> Result<(), String> {
        let coordinator = world.coordinator();
        let completed = |platoon: PlatoonId| {
            attempts
                .iter()
                .find(|r| r.platoon == platoon && r.outcome == Outcome::Completed)
                .ok_or_else(|| format!("Platoon {} never completed an overtake", platoon))
        };
        let no_collisions = || match world.freeway().collisions() {
            0 => Ok(()),
            n => Err(format!("{} collisions", n)),
        };

        match scenario {
            ScenarioId::SlowTruck | ScenarioId::LaggyRadio => {
                let platoon = cast.platoons[0];
                completed(platoon)?;
                no_collisions()?;
                match coordinator.platoon(platoon).map(|p| p.lane()) {
                    Some(0) => Ok(()),
                    lane => Err(format!("Platoon ended in lane {:?}, expected 0", lane)),
                }
            }
            ScenarioId::BelowThreshold => {
                if attempts.is_empty() && coordinator.attempts().count() == 0 {
                    Ok(())
                } else {
                    Err(format!("{} attempts triggered below the threshold", attempts.len()))
                }
            }
            ScenarioId::BlockedLane => {
                if attempts.is_empty() {
                    return Err("No attempt was triggered".to_string());
                }
                let expected = Some(RejectionReason::Declined {
                    by: cast.neighbors[0],
                    cause: RejectCause::Declined,
                });
                if let Some(r) = attempts.iter().find(|r| r.rejection != expected) {
                    return Err(format!("Attempt {} ended {} ({:?})", r.id, r.outcome, r.rejection));
                }
                if attempts.iter().any(|r| !r.lane_change_order.is_empty()) {
                    return Err("A lane change was commanded despite the rejection".to_string());
                }
                Ok(())
            }
            ScenarioId::RadioSilence => {
                let first = attempts.first().ok_or("No attempt was triggered")?;
                let timeout = coordinator.config().decision_timeout_steps;
                if first.rejection != Some(RejectionReason::Timeout) {
                    return Err(format!("Expected a timeout, got {} ({:?})", first.outcome, first.rejection));
                }
                if first.ended_at - first.triggered_at != timeout {
                    return Err(format!(
                        "Rejected after {} steps, expected {}",
                        first.ended_at - first.triggered_at,
                        timeout
                    ));
                }
                Ok(())
            }
            ScenarioId::TimeCap => {
                let first = attempts.first().ok_or("No attempt was triggered")?;
                let cap = coordinator.config().max_overtaking_steps();
                if first.abort != Some(AbortReason::TimeExceeded) {
                    return Err(format!("Expected a time-cap abort, got {} ({:?})", first.outcome, first.abort));
                }
                if first.ended_at - first.triggered_at != cap {
                    return Err(format!("Aborted after {} steps, expected {}", first.ended_at - first.triggered_at, cap));
                }
                Ok(())
            }
            ScenarioId::StayLeft => {
                let platoon = cast.platoons[0];
                let record = completed(platoon)?;
                no_collisions()?;
                if record.lane_change_order.len() != PLATOON_SIZE {
                    return Err(format!("{} lane changes, expected {}", record.lane_change_order.len(), PLATOON_SIZE));
                }
                match coordinator.platoon(platoon).map(|p| p.lane()) {
                    Some(1) => Ok(()),
                    lane => Err(format!("Platoon ended in lane {:?}, expected 1", lane)),
                }
            }
            ScenarioId::TwinPlatoons => {
                for platoon in &cast.platoons {
                    completed(*platoon)?;
                }
                no_collisions()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_threshold_never_triggers() {
        let result = ScenarioRunner::new(42).run(ScenarioId::BelowThreshold);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.messages_sent, 0);
    }

    #[test]
    fn test_radio_silence_times_out() {
        let result = ScenarioRunner::new(7).with_duration(5.0).run(ScenarioId::RadioSilence);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.messages_delivered, 0);
        assert_eq!(result.attempts[0].outcome, Outcome::Rejected);
    }

    #[test]
    fn test_blocked_lane_rejects() {
        let result = ScenarioRunner::new(42).with_duration(20.0).run(ScenarioId::BlockedLane);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.rejected >= 1);
        assert_eq!(result.metrics.completed, 0);
    }

    #[test]
    fn test_slow_truck_completes() {
        let result = ScenarioRunner::new(42).run(ScenarioId::SlowTruck);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.collisions, 0);
        let record = &result.attempts[0];
        assert_eq!(record.lane_change_order.len(), 2 * PLATOON_SIZE);
        assert!(record.duration_secs <= 45.0);
    }

    #[test]
    fn test_laggy_radio_completes() {
        let result = ScenarioRunner::new(42).run(ScenarioId::LaggyRadio);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.completed >= 1);
        assert_eq!(result.metrics.collisions, 0);
    }

    #[test]
    fn test_time_cap_aborts() {
        let result = ScenarioRunner::new(42).run(ScenarioId::TimeCap);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.attempts[0].outcome, Outcome::Aborted);
        assert_eq!(result.attempts[0].abort, Some(AbortReason::TimeExceeded));
    }

    #[test]
    fn test_stay_left_keeps_overtaking_lane() {
        let result = ScenarioRunner::new(42).run(ScenarioId::StayLeft);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.attempts[0].lane_change_order.len(), PLATOON_SIZE);
    }

    #[test]
    fn test_twin_platoons_both_complete() {
        let result = ScenarioRunner::new(42).run(ScenarioId::TwinPlatoons);
        assert!(result.passed, "{:?}", result.failure_reason);

        let mut completed: Vec<&AttemptRecord> =
            result.attempts.iter().filter(|r| r.outcome == Outcome::Completed).collect();
        completed.sort_by_key(|r| r.id);
        assert_eq!(completed.len(), 2);
        assert_ne!(completed[0].platoon, completed[1].platoon);
        // Ids are handed out at trigger time
        assert!(completed[0].triggered_at <= completed[1].triggered_at);
    }

    #[test]
    fn test_same_seed_same_result() {
        let a = ScenarioRunner::new(99).with_duration(20.0).run(ScenarioId::TwinPlatoons);
        let b = ScenarioRunner::new(99).with_duration(20.0).run(ScenarioId::TwinPlatoons);
        assert!(a.passed, "{:?}", a.failure_reason);
        assert_eq!(
            serde_json::to_string(&a.attempts).unwrap(),
            serde_json::to_string(&b.attempts).unwrap()
        );
        assert_eq!(a.total_steps, b.total_steps);
    }

    #[test]
    fn test_export_collects_frames() {
        let (result, export) = ScenarioRunner::new(1).run_with_export(ScenarioId::RadioSilence, 10);
        assert_eq!(export.frames.len() as u64, (result.total_steps + 9) / 10);
        assert_eq!(export.passed, result.passed);
        assert_eq!(export.attempts.len(), result.attempts.len());
    }
}
