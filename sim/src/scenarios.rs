//! Scenario definitions.
//!
//! Each scenario is a named configuration of road users and sensors around
//! the ego vehicle. All scenarios are deterministic given the same seed.

use crate::{
    sensor_sim::{SimSensor, SimSensorParams},
    target::{MotionSpec, Target},
};
use fusion_core::{ObjectClass, SensorType};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Which pre-defined scenario to load.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum ScenarioKind {
    /// 4 road users, one lidar, radar and camera, low clutter
    Simple,
    /// Lidar drops out for 3 s, radar + camera must carry the tracks
    SensorDropout,
    /// Radar and camera disagree on the class of every target
    ConflictingClasses,
    /// 60 road users, two sensors per family, high clutter
    Dense,
}

/// A fully configured simulation scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub seed: u64,
    pub duration: f64, // seconds
    /// Fusion cycle period (s)
    pub cycle_dt: f64,
    pub targets: Vec<Target>,
    pub sensors: Vec<SimSensor>,
}

impl Scenario {
    /// Build the named scenario. Uses `seed` for repeatability.
    pub fn build(kind: ScenarioKind, seed: u64) -> Self {
        match kind {
            ScenarioKind::Simple => Self::simple(seed),
            ScenarioKind::SensorDropout => Self::sensor_dropout(seed),
            ScenarioKind::ConflictingClasses => Self::conflicting_classes(seed),
            ScenarioKind::Dense => Self::dense(seed),
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 1: Simple
    // -----------------------------------------------------------------------
    fn simple(seed: u64) -> Self {
        Scenario {
            name: "simple".into(),
            seed,
            duration: 20.0,
            cycle_dt: 0.1,
            targets: urban_mix(),
            sensors: standard_suite(),
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 2: Sensor dropout
    // -----------------------------------------------------------------------
    fn sensor_dropout(seed: u64) -> Self {
        let mut sensors = standard_suite();
        for sensor in &mut sensors {
            if sensor.sensor_type == SensorType::Lidar {
                sensor.params.dropouts.push((5.0, 8.0));
            }
        }
        Scenario {
            name: "sensor_dropout".into(),
            seed,
            duration: 15.0,
            cycle_dt: 0.1,
            targets: urban_mix(),
            sensors,
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 3: Conflicting classes
    // -----------------------------------------------------------------------
    fn conflicting_classes(seed: u64) -> Self {
        let sensors = standard_suite()
            .into_iter()
            .map(|mut sensor| {
                match sensor.sensor_type {
                    SensorType::Radar => {
                        sensor.params.class_accuracy = 0.2;
                        sensor.params.class_confidence = 0.9;
                    }
                    SensorType::Camera => sensor.params.class_accuracy = 0.7,
                    SensorType::Lidar => {}
                }
                sensor
            })
            .collect();
        Scenario {
            name: "conflicting_classes".into(),
            seed,
            duration: 20.0,
            cycle_dt: 0.1,
            targets: urban_mix(),
            sensors,
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 4: Dense
    // -----------------------------------------------------------------------
    fn dense(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(1));

        let targets = (0..60)
            .map(|i| {
                let class = ObjectClass::ALL[i % 4];
                let px = (rng.gen::<f64>() - 0.5) * 120.0;
                let py = (rng.gen::<f64>() - 0.5) * 60.0;
                let speed = match class {
                    ObjectClass::Pedestrian => 1.4,
                    ObjectClass::Bicycle => 5.0,
                    ObjectClass::Vehicle => 12.0,
                    _ => 0.0,
                } * (0.5 + rng.gen::<f64>());
                let heading = rng.gen::<f64>() * std::f64::consts::TAU;
                let motion = if rng.gen::<f64>() < 0.3 {
                    MotionSpec::ConstantTurn {
                        omega: (rng.gen::<f64>() - 0.5) * 0.4,
                    }
                } else {
                    MotionSpec::ConstantVelocity
                };
                let appear = if i % 10 == 9 { Some(rng.gen::<f64>() * 10.0) } else { None };
                Target::new(
                    i as u64,
                    class,
                    [px, py],
                    [speed * heading.cos(), speed * heading.sin()],
                    motion,
                )
                .active_between(appear, None)
            })
            .collect();

        let mut sensors = standard_suite();
        sensors.extend([
            sensor(SensorType::Lidar, "lidar_rear", [-1.0, 0.0], SimSensorParams::lidar(), 0.05),
            sensor(SensorType::Radar, "radar_rear", [-2.0, 0.0], SimSensorParams::radar(), 0.02),
            sensor(SensorType::Camera, "camera_rear", [-1.5, 0.0], SimSensorParams::camera(), 0.03),
        ]);
        for s in &mut sensors {
            s.params.lambda_clutter *= 3.0;
        }

        Scenario {
            name: "dense".into(),
            seed,
            duration: 30.0,
            cycle_dt: 0.1,
            targets,
            sensors,
        }
    }
}

/// Pedestrian crossing, cyclist, oncoming car, turning car; one joins late
/// and one leaves early.
fn urban_mix() -> Vec<Target> {
    vec![
        Target::new(0, ObjectClass::Pedestrian, [15.0, -6.0], [0.0, 1.3], MotionSpec::ConstantVelocity),
        Target::new(1, ObjectClass::Bicycle, [-10.0, 3.0], [4.5, 0.0], MotionSpec::ConstantVelocity),
        Target::new(2, ObjectClass::Vehicle, [60.0, -2.0], [-10.0, 0.0], MotionSpec::ConstantVelocity)
            .active_between(None, Some(12.0)),
        Target::new(
            3,
            ObjectClass::Vehicle,
            [20.0, 10.0],
            [6.0, 0.0],
            MotionSpec::ConstantTurn { omega: 0.1 },
        )
        .active_between(Some(2.0), None),
    ]
}

fn standard_suite() -> Vec<SimSensor> {
    vec![
        sensor(SensorType::Lidar, "lidar_top", [0.0, 0.0], SimSensorParams::lidar(), 0.0),
        sensor(SensorType::Radar, "radar_front", [2.0, 0.0], SimSensorParams::radar(), 0.01),
        sensor(SensorType::Camera, "camera_front", [1.5, 0.0], SimSensorParams::camera(), 0.02),
    ]
}

fn sensor(
    sensor_type: SensorType,
    id: &str,
    position: [f64; 2],
    params: SimSensorParams,
    phase: f64,
) -> SimSensor {
    let mut s = SimSensor::new(sensor_type, id, params, phase);
    s.position = position;
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_scenario_has_all_families() {
        for kind in [
            ScenarioKind::Simple,
            ScenarioKind::SensorDropout,
            ScenarioKind::ConflictingClasses,
            ScenarioKind::Dense,
        ] {
            let s = Scenario::build(kind, 7);
            for family in SensorType::ALL {
                assert!(s.sensors.iter().any(|x| x.sensor_type == family), "{kind:?} lacks {family}");
            }
            assert!(!s.targets.is_empty());
        }
    }

    #[test]
    fn dense_is_deterministic() {
        let a = Scenario::build(ScenarioKind::Dense, 3);
        let b = Scenario::build(ScenarioKind::Dense, 3);
        assert_eq!(a.targets.len(), 60);
        for (x, y) in a.targets.iter().zip(&b.targets) {
            assert_eq!(x.state, y.state);
        }
    }
}
