//! Target trajectory models and state propagation.
//!
//! Each target has a true state [px,py,pz,vx,vy,vz], an object class, a box
//! size and a `MotionSpec` describing how it moves. The simulator steps each
//! target forward in time.

use fusion_core::{metrics::GroundTruth, types::Vec3, Geometry, ObjectClass};
use serde::{Deserialize, Serialize};

/// Describes target motion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MotionSpec {
    /// Constant velocity: no acceleration. State propagates as CV.
    ConstantVelocity,
    /// Constant-turn-rate on XY plane. `omega` = yaw rate (rad/s).
    ConstantTurn { omega: f64 },
    /// Constant acceleration model. `ax, ay, az` in m/s².
    ConstantAccel { ax: f64, ay: f64, az: f64 },
}

/// A simulated road user with ground-truth state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    /// Unique target ID (used for metrics and oracle association)
    pub id: u64,
    pub class: ObjectClass,
    /// True state [px, py, pz, vx, vy, vz]
    pub state: [f64; 6],
    /// Box extent (length, width, height) in meters
    pub size: [f64; 3],
    pub motion: MotionSpec,
    /// Optional: target disappears after this time
    pub disappear_at: Option<f64>,
    /// Optional: target appears after this time (no detections before)
    pub appear_at: Option<f64>,
}

impl Target {
    pub fn new(id: u64, class: ObjectClass, pos: [f64; 2], vel: [f64; 2], motion: MotionSpec) -> Self {
        Self {
            id,
            class,
            state: [pos[0], pos[1], 0.0, vel[0], vel[1], 0.0],
            size: default_size(class),
            motion,
            disappear_at: None,
            appear_at: None,
        }
    }

    pub fn active_between(mut self, appear_at: Option<f64>, disappear_at: Option<f64>) -> Self {
        self.appear_at = appear_at;
        self.disappear_at = disappear_at;
        self
    }

    /// Propagate true state by `dt` seconds according to motion spec.
    pub fn step(&mut self, dt: f64) {
        let s = &mut self.state;
        match self.motion {
            MotionSpec::ConstantVelocity => {
                s[0] += s[3] * dt;
                s[1] += s[4] * dt;
                s[2] += s[5] * dt;
            }
            MotionSpec::ConstantTurn { omega } => {
                let v = (s[3] * s[3] + s[4] * s[4]).sqrt();
                let heading = s[4].atan2(s[3]);
                let new_heading = heading + omega * dt;
                s[0] += v * heading.cos() * dt;
                s[1] += v * heading.sin() * dt;
                s[3] = v * new_heading.cos();
                s[4] = v * new_heading.sin();
            }
            MotionSpec::ConstantAccel { ax, ay, az } => {
                s[0] += s[3] * dt + 0.5 * ax * dt * dt;
                s[1] += s[4] * dt + 0.5 * ay * dt * dt;
                s[2] += s[5] * dt + 0.5 * az * dt * dt;
                s[3] += ax * dt;
                s[4] += ay * dt;
                s[5] += az * dt;
            }
        }
    }

    /// True if target is active at time `t`.
    pub fn is_active(&self, t: f64) -> bool {
        if self.appear_at.is_some_and(|appear| t < appear) {
            return false;
        }
        if self.disappear_at.is_some_and(|disappear| t >= disappear) {
            return false;
        }
        true
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.state[0], self.state[1], self.state[2])
    }

    pub fn velocity(&self) -> Vec3 {
        Vec3::new(self.state[3], self.state[4], self.state[5])
    }

    /// True box, heading along the velocity.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            center: self.position(),
            velocity: self.velocity(),
            size: Vec3::new(self.size[0], self.size[1], self.size[2]),
            yaw: self.state[4].atan2(self.state[3]),
        }
    }

    pub fn ground_truth(&self, time: f64) -> GroundTruth {
        GroundTruth {
            target_id: self.id,
            time,
            class: self.class,
            position: self.position(),
            velocity: self.velocity(),
        }
    }
}

fn default_size(class: ObjectClass) -> [f64; 3] {
    match class {
        ObjectClass::Pedestrian => [0.6, 0.6, 1.7],
        ObjectClass::Bicycle => [1.8, 0.6, 1.6],
        ObjectClass::Vehicle => [4.5, 1.9, 1.5],
        ObjectClass::Other | ObjectClass::Unknown => [1.0, 1.0, 1.0],
    }
}
