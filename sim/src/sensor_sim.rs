//! Lidar / radar / camera detection simulator.
//!
//! Generates asynchronous per-sensor frames with:
//! - Gaussian position and velocity noise
//! - Miss probability (1 - P_D) and a maximum range
//! - Class confusion (wrong class with probability 1 - `class_accuracy`)
//! - Poisson clutter (false alarms, no upstream id)
//! - Timestamp jitter and scheduled dropout windows

use crate::target::Target;
use fusion_core::{
    types::Vec3, ClassProbs, DetectedObject, Geometry, ObjectClass, SensorId, SensorType,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Per-sensor simulation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimSensorParams {
    /// Frames per second
    pub refresh_rate: f64,
    pub p_detection: f64,
    pub max_range: f64,
    /// Position noise (1σ, meters)
    pub position_noise_std: f64,
    /// Velocity noise (1σ, m/s); ignored unless `reports_velocity`
    pub velocity_noise_std: f64,
    pub reports_velocity: bool,
    /// Probability the reported class is the true one
    pub class_accuracy: f64,
    /// Probability mass the detector puts on its reported class
    pub class_confidence: f64,
    /// Mean number of false alarms per frame
    pub lambda_clutter: f64,
    /// Uniform timestamp jitter half-width (s)
    pub timestamp_jitter: f64,
    /// `[start, end)` windows during which the sensor produces nothing
    pub dropouts: Vec<(f64, f64)>,
}

impl SimSensorParams {
    pub fn lidar() -> Self {
        Self {
            refresh_rate: 10.0,
            p_detection: 0.95,
            max_range: 120.0,
            position_noise_std: 0.15,
            velocity_noise_std: 1.0,
            reports_velocity: false,
            class_accuracy: 0.9,
            class_confidence: 0.8,
            lambda_clutter: 0.2,
            timestamp_jitter: 0.002,
            dropouts: Vec::new(),
        }
    }

    pub fn radar() -> Self {
        Self {
            refresh_rate: 20.0,
            p_detection: 0.9,
            max_range: 200.0,
            position_noise_std: 0.8,
            velocity_noise_std: 0.25,
            reports_velocity: true,
            class_accuracy: 0.6,
            class_confidence: 0.5,
            lambda_clutter: 1.0,
            timestamp_jitter: 0.005,
            dropouts: Vec::new(),
        }
    }

    pub fn camera() -> Self {
        Self {
            refresh_rate: 15.0,
            p_detection: 0.85,
            max_range: 80.0,
            position_noise_std: 1.5,
            velocity_noise_std: 2.0,
            reports_velocity: false,
            class_accuracy: 0.95,
            class_confidence: 0.9,
            lambda_clutter: 0.3,
            timestamp_jitter: 0.01,
            dropouts: Vec::new(),
        }
    }
}

/// One configured sensor in the simulation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimSensor {
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    /// Mounting position in the fusion frame
    pub position: [f64; 2],
    pub params: SimSensorParams,
    /// Next scheduled frame time
    pub next_scan_time: f64,
}

impl SimSensor {
    pub fn new(sensor_type: SensorType, sensor_id: &str, params: SimSensorParams, phase: f64) -> Self {
        Self {
            sensor_type,
            sensor_id: SensorId::new(sensor_id),
            position: [0.0, 0.0],
            params,
            next_scan_time: phase,
        }
    }

    /// Check if this sensor should fire at the current simulation time.
    pub fn should_scan(&self, t: f64) -> bool {
        t >= self.next_scan_time
    }

    /// Advance the schedule by one frame interval.
    pub fn advance_schedule(&mut self) {
        self.next_scan_time += 1.0 / self.params.refresh_rate;
    }

    pub fn in_dropout(&self, t: f64) -> bool {
        self.params.dropouts.iter().any(|&(start, end)| t >= start && t < end)
    }
}

/// One sensor's raw output, before association.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawFrame {
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    pub timestamp: f64,
    pub objects: Vec<DetectedObject>,
}

/// Generates detection frames from a set of targets.
pub struct SensorSimulator {
    pub sensors: Vec<SimSensor>,
    rng: ChaCha8Rng,
}

impl SensorSimulator {
    pub fn new(sensors: Vec<SimSensor>, seed: u64) -> Self {
        Self {
            sensors,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Generate every frame due at or before `sim_time`. Targets are sampled
    /// at their current state.
    pub fn generate_frames(&mut self, targets: &[Target], sim_time: f64) -> Vec<RawFrame> {
        let mut frames = Vec::new();

        for sensor in &mut self.sensors {
            while sensor.should_scan(sim_time) {
                let scan_time = sensor.next_scan_time;
                sensor.advance_schedule();
                if sensor.in_dropout(scan_time) {
                    continue;
                }
                let p = &sensor.params;
                let mut objects = Vec::new();

                for target in targets {
                    if !target.is_active(scan_time) {
                        continue;
                    }
                    if self.rng.gen::<f64>() > p.p_detection {
                        continue;
                    }
                    let dx = target.state[0] - sensor.position[0];
                    let dy = target.state[1] - sensor.position[1];
                    if (dx * dx + dy * dy).sqrt() > p.max_range {
                        continue;
                    }

                    let mut geometry = target.geometry();
                    geometry.center += noise3(&mut self.rng, p.position_noise_std);
                    geometry.velocity = if p.reports_velocity {
                        geometry.velocity + noise3(&mut self.rng, p.velocity_noise_std)
                    } else {
                        Vec3::zeros()
                    };

                    let class = if self.rng.gen::<f64>() < p.class_accuracy {
                        target.class
                    } else {
                        confused_class(&mut self.rng, target.class)
                    };
                    objects.push(
                        DetectedObject::new(geometry, reported_probs(class, p.class_confidence))
                            .with_hint(target.id),
                    );
                }

                for _ in 0..poisson(&mut self.rng, p.lambda_clutter) {
                    let r = p.max_range * self.rng.gen::<f64>().sqrt();
                    let az = self.rng.gen::<f64>() * std::f64::consts::TAU;
                    let geometry = Geometry::at(
                        sensor.position[0] + r * az.cos(),
                        sensor.position[1] + r * az.sin(),
                    );
                    let class = ObjectClass::ALL[self.rng.gen_range(0..4)];
                    objects.push(DetectedObject::new(geometry, reported_probs(class, 0.5)));
                }

                let jitter = (self.rng.gen::<f64>() * 2.0 - 1.0) * p.timestamp_jitter;
                frames.push(RawFrame {
                    sensor_type: sensor.sensor_type,
                    sensor_id: sensor.sensor_id.clone(),
                    timestamp: (scan_time + jitter).max(0.0),
                    objects,
                });
            }
        }

        frames
    }
}

/// `confidence` on the reported class, the rest left on `Unknown`.
fn reported_probs(class: ObjectClass, confidence: f64) -> ClassProbs {
    let mut probs = ClassProbs::certain(ObjectClass::Unknown);
    probs.set(ObjectClass::Unknown, 1.0 - confidence);
    probs.set(class, confidence);
    probs
}

fn confused_class(rng: &mut ChaCha8Rng, truth: ObjectClass) -> ObjectClass {
    let others: Vec<ObjectClass> = ObjectClass::ALL[..4]
        .iter()
        .copied()
        .filter(|&c| c != truth)
        .collect();
    others[rng.gen_range(0..others.len())]
}

fn noise3(rng: &mut ChaCha8Rng, std: f64) -> Vec3 {
    let nx: f64 = rng.sample(StandardNormal);
    let ny: f64 = rng.sample(StandardNormal);
    Vec3::new(nx * std, ny * std, 0.0)
}

/// Draw N until product of U < e^{-lambda}.
fn poisson(rng: &mut ChaCha8Rng, lambda: f64) -> usize {
    if lambda <= 0.0 {
        return 0;
    }
    let threshold = (-lambda).exp();
    let mut n = 0usize;
    let mut prod = rng.gen::<f64>();
    while prod > threshold && n < 50 {
        prod *= rng.gen::<f64>();
        n += 1;
    }
    n
}
