//! Safety-gap math for cooperative lane changes.
//!
//! Two areas around a vehicle are checked before it may move into an
//! adjacent lane:
//!
//! ```text
//!        rear area                 front area
//!   <---- d_min ---->          <-- d_safety -->
//!   [R]............[ vehicle ]...............[F]     adjacent lane
//!                  [ vehicle ]                        own lane
//! ```
//!
//! The front area is free if the nearest vehicle ahead in the adjacent lane
//! is at least the platoon safety distance away. The rear area is free if
//! the nearest vehicle behind is far enough away to keep its own safety gap
//! while braking with at most an accepted deceleration.

use crate::config::OvertakingConfig;
use overtake_env::{Direction, Side, TrafficEnvironment, VehicleId, VehicleTelemetry};

/// Safety distance (m) a platoon vehicle keeps to a non-platooning vehicle ahead.
pub fn safety_dist_platoon(config: &OvertakingConfig, headway: f64, speed: f64, in_lane_change: bool) -> f64 {
    let d = headway * speed;
    if in_lane_change {
        d
    } else {
        d * (1.0 + config.oscillation_mod)
    }
}

/// Safety distance (m) a non-platooning truck keeps at speed `v`.
pub fn safety_dist_slower(config: &OvertakingConfig, v: f64) -> f64 {
    config.truck_min_gap.max(config.truck_headway * v)
}

/// Deceleration a rear vehicle in the adjacent lane is expected to accept.
pub fn accepted_decel(config: &OvertakingConfig, direction: Direction, in_lane_change: bool) -> f64 {
    if in_lane_change {
        config.max_decel_in_lane_change
    } else if direction == Direction::Right {
        config.max_decel_returning
    } else {
        config.max_decel_entering
    }
}

/// Minimum distance (m) a rear vehicle driving at `v_rear` must be behind a
/// vehicle at `v_platoon` so that it brakes with at most `a` (m/s^2, <= 0)
/// and still keeps its time gap. Infinite if that is impossible.
pub fn d_min(
    config: &OvertakingConfig,
    a: f64,
    v_platoon: f64,
    v_rear: f64,
    direction: Direction,
    in_lane_change: bool,
) -> f64 {
    let t_r = config.reaction_time;
    let t_g = config.time_gap;
    let mut d = if v_rear > v_platoon && a < 0.0 {
        (-1.0 / (2.0 * a)) * (v_platoon - v_rear).powi(2) + v_rear * t_r + v_platoon * t_g
    } else if v_rear <= v_platoon && a <= 0.0 {
        v_rear * (t_r + t_g)
    } else {
        f64::INFINITY
    };
    if direction == Direction::Right {
        d = d.max(config.truck_min_gap);
    }
    if !in_lane_change {
        d *= 1.0 + config.oscillation_mod;
    }
    d
}

/// Inputs of the overtaking time prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassingInput {
    /// Current platoon speed (m/s)
    pub platoon_speed: f64,
    /// Speed of the vehicle to be passed (m/s)
    pub slower_speed: f64,
    /// Gap to the vehicle to be passed (m)
    pub distance: f64,
    /// Maximum acceleration of the leader (m/s^2)
    pub max_accel: f64,
    /// Highest speed the platoon will drive in the overtaking lane (m/s)
    pub lane_speed_cap: f64,
    /// Front of the leader to rear of the last member (m)
    pub platoon_length: f64,
    /// Lateral speed of the leader (m/s)
    pub lateral_speed: f64,
}

/// Predicted time (s) to pass a slower vehicle of maximum truck length,
/// including the lateral lane change. Infinite when passing is impossible.
pub fn overtaking_time(config: &OvertakingConfig, input: &PassingInput) -> f64 {
    let a = input.max_accel;
    let v_p = input.platoon_speed;
    let v_s = input.slower_speed;
    let v_max = input.lane_speed_cap;
    if a <= 0.0 || input.lateral_speed <= 0.0 || v_max <= v_s {
        return f64::INFINITY;
    }

    let l_total =
        input.distance + config.truck_max_length + safety_dist_slower(config, v_s) + input.platoon_length;
    let root = ((v_p - v_s).powi(2) + 2.0 * a * l_total).sqrt();
    let v_over = v_s + root;
    let t_pass = if v_over <= v_max {
        (1.0 / a) * (v_s - v_p + root)
    } else {
        (l_total / (v_max - v_s)) * (1.0 + (v_max - v_p).powi(2) / (2.0 * a * l_total))
    };
    if !t_pass.is_finite() {
        return f64::INFINITY;
    }
    t_pass + config.lane_width / input.lateral_speed
}

/// Result of an area check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AreaStatus {
    Free,
    Occupied {
        /// Nearest vehicle in the area
        culprit: VehicleId,
        /// Its actual gap (m)
        distance: f64,
        /// Gap it would need (m)
        required: f64,
    },
}

impl AreaStatus {
    pub fn is_free(&self) -> bool {
        matches!(self, AreaStatus::Free)
    }
}

/// Checks the front area of `vehicle` in the `direction` lane.
///
/// Vehicles listed in `ignore` (the own platoon) never occupy an area.
pub fn front_area<E: TrafficEnvironment + ?Sized>(
    env: &E,
    config: &OvertakingConfig,
    vehicle: &VehicleTelemetry,
    direction: Direction,
    in_lane_change: bool,
    ignore: &[VehicleId],
) -> AreaStatus {
    let nearest = env
        .neighbors(vehicle.id, direction, Side::Front, config.detection_range_front)
        .into_iter()
        .find(|n| !ignore.contains(&n.id));
    let Some(neighbor) = nearest else {
        return AreaStatus::Free;
    };
    let required = safety_dist_platoon(config, vehicle.headway_time, vehicle.speed, in_lane_change);
    if neighbor.distance < required {
        AreaStatus::Occupied {
            culprit: neighbor.id,
            distance: neighbor.distance,
            required,
        }
    } else {
        AreaStatus::Free
    }
}

/// Checks the rear area of `vehicle` in the `direction` lane.
///
/// `direction` also selects the accepted deceleration: moving left, returning
/// right, or already in a lane change.
pub fn rear_area<E: TrafficEnvironment + ?Sized>(
    env: &E,
    config: &OvertakingConfig,
    vehicle: &VehicleTelemetry,
    direction: Direction,
    in_lane_change: bool,
    ignore: &[VehicleId],
) -> AreaStatus {
    let nearest = env
        .neighbors(vehicle.id, direction, Side::Rear, config.detection_range_rear)
        .into_iter()
        .find(|n| !ignore.contains(&n.id));
    let Some(neighbor) = nearest else {
        return AreaStatus::Free;
    };
    let a = accepted_decel(config, direction, in_lane_change);
    let required = d_min(config, a, vehicle.speed, neighbor.speed, direction, in_lane_change);
    if neighbor.distance < required {
        AreaStatus::Occupied {
            culprit: neighbor.id,
            distance: neighbor.distance,
            required,
        }
    } else {
        AreaStatus::Free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use overtake_env::{StubTraffic, VehicleSpawn, VehicleType};

    fn spawn(env: &mut StubTraffic, lane: u8, position: f64, speed: f64) -> VehicleId {
        env.spawn_vehicle(VehicleSpawn {
            vehicle_type: VehicleType::platoon_car(),
            route: "freeway".to_string(),
            position,
            lane,
            speed,
        })
        .unwrap()
    }

    #[test]
    fn test_safety_distances() {
        let config = OvertakingConfig::default();
        assert_relative_eq!(safety_dist_platoon(&config, 1.0, 30.0, true), 30.0);
        assert_relative_eq!(safety_dist_platoon(&config, 1.0, 30.0, false), 30.3, epsilon = 1e-9);
        assert_relative_eq!(safety_dist_slower(&config, 20.0), 50.0);
        assert_relative_eq!(safety_dist_slower(&config, 30.0), 54.0, epsilon = 1e-9);
    }

    #[test]
    fn test_d_min_branches() {
        let config = OvertakingConfig::default();
        // Faster rear vehicle has to brake
        assert_relative_eq!(d_min(&config, -1.0, 25.0, 30.0, Direction::Left, true), 62.5, epsilon = 1e-9);
        // Slower rear vehicle only needs its time gap
        assert_relative_eq!(d_min(&config, -1.0, 30.0, 25.0, Direction::Left, true), 45.0, epsilon = 1e-9);
        // No braking accepted
        assert!(d_min(&config, 0.0, 25.0, 30.0, Direction::Left, true).is_infinite());
        // Returning right keeps the truck minimum gap, raised outside a lane change
        assert_relative_eq!(d_min(&config, 0.0, 30.0, 25.0, Direction::Right, false), 50.5, epsilon = 1e-9);
    }

    #[test]
    fn test_accepted_decel() {
        let config = OvertakingConfig::default();
        assert_eq!(accepted_decel(&config, Direction::Left, false), -1.0);
        assert_eq!(accepted_decel(&config, Direction::Right, false), 0.0);
        assert_eq!(accepted_decel(&config, Direction::Left, true), -3.5);
    }

    #[test]
    fn test_overtaking_time_below_lane_cap() {
        let config = OvertakingConfig::default();
        let input = PassingInput {
            platoon_speed: 25.0,
            slower_speed: 20.0,
            distance: 50.0,
            max_accel: 2.5,
            lane_speed_cap: 60.0,
            platoon_length: 30.0,
            lateral_speed: 1.0,
        };
        // l_total = 50 + 18.75 + 50 + 30
        let expected = (1.0 / 2.5) * (20.0 - 25.0 + 768.75f64.sqrt()) + 3.2;
        assert_relative_eq!(overtaking_time(&config, &input), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_overtaking_time_capped_by_lane_speed() {
        let config = OvertakingConfig::default();
        let input = PassingInput {
            platoon_speed: 25.0,
            slower_speed: 20.0,
            distance: 50.0,
            max_accel: 2.5,
            lane_speed_cap: 36.0,
            platoon_length: 30.0,
            lateral_speed: 1.0,
        };
        let expected = (148.75 / 16.0) * (1.0 + 121.0 / 743.75) + 3.2;
        assert_relative_eq!(overtaking_time(&config, &input), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_overtaking_time_degenerate() {
        let config = OvertakingConfig::default();
        let input = PassingInput {
            platoon_speed: 25.0,
            slower_speed: 30.0,
            distance: 50.0,
            max_accel: 2.5,
            lane_speed_cap: 30.0,
            platoon_length: 30.0,
            lateral_speed: 1.0,
        };
        assert!(overtaking_time(&config, &input).is_infinite());
        assert!(overtaking_time(&config, &PassingInput { lateral_speed: 0.0, ..input }).is_infinite());
    }

    #[test]
    fn test_front_area_ignores_members() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let me = spawn(&mut env, 0, 100.0, 30.0);
        let mate = spawn(&mut env, 1, 110.0, 30.0);
        let me_t = env.telemetry(me).unwrap();

        assert!(matches!(
            front_area(&env, &config, &me_t, Direction::Left, false, &[]),
            AreaStatus::Occupied { culprit, .. } if culprit == mate
        ));
        assert!(front_area(&env, &config, &me_t, Direction::Left, false, &[mate]).is_free());
    }

    #[test]
    fn test_rear_area_needs_d_min() {
        let config = OvertakingConfig::default();
        let mut env = StubTraffic::new(2, 36.0);
        let me = spawn(&mut env, 0, 100.0, 25.0);
        let rear = spawn(&mut env, 1, 60.0, 30.0);
        let me_t = env.telemetry(me).unwrap();

        // Gap 36 m, faster car approaching
        match rear_area(&env, &config, &me_t, Direction::Left, false, &[]) {
            AreaStatus::Occupied { culprit, distance, .. } => {
                assert_eq!(culprit, rear);
                assert_relative_eq!(distance, 36.0);
            }
            AreaStatus::Free => panic!("rear area should be occupied"),
        }

        env.set_position(rear, 0.0);
        assert!(rear_area(&env, &config, &me_t, Direction::Left, false, &[]).is_free());
    }
}
