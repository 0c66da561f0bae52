//! Motion fusion: constant-velocity Kalman filter over the fused kinematics.
//!
//! ## State vector
//! x = [px, py, pz, vx, vy, vz]ᵀ
//!
//! ## CV Transition model
//! F = I₆ + dt * [[0₃ I₃]; [0₃ 0₃]]
//!
//! ## Process noise (discrete white noise acceleration)
//! Q_pos = q·dt⁴/4, Q_pos_vel = q·dt³/2, Q_vel = q·dt² per axis
//!
//! ## Observations
//! Every family observes the box centre. Families flagged
//! `measures_velocity` also observe velocity, giving a 6×6 H instead of 3×6.
//! Detections older than the filter time are not applied: the filter never
//! rewinds.

use crate::{
    config::{MotionConfig, SensorFamilyConfig},
    types::{Geometry, Vec3},
};
use nalgebra::{DMatrix, DVector, Matrix6, Vector6};
use tracing::warn;

pub type StateVec = Vector6<f64>;
pub type StateCov = Matrix6<f64>;
type DMat = DMatrix<f64>;
type DVec = DVector<f64>;

/// Tolerance (s) under which a detection counts as simultaneous with the filter.
const TIME_EPS: f64 = 1e-9;

#[derive(Clone, Debug)]
pub struct MotionFusion {
    state: StateVec,
    cov: StateCov,
    timestamp: f64,
    process_noise_std: f64,
}

impl MotionFusion {
    /// Initialise from the first detection of a track.
    pub fn new(
        geometry: &Geometry,
        timestamp: f64,
        family: &SensorFamilyConfig,
        config: &MotionConfig,
    ) -> Self {
        let c = geometry.center;
        let v = geometry.velocity;
        let ps = family.position_noise_std * family.position_noise_std;
        let vel_std = if family.measures_velocity {
            family.velocity_noise_std
        } else {
            config.initial_velocity_std
        };
        let vs = vel_std * vel_std;
        Self {
            state: StateVec::new(c[0], c[1], c[2], v[0], v[1], v[2]),
            cov: StateCov::from_diagonal(&Vector6::new(ps, ps, ps, vs, vs, vs)),
            timestamp,
            process_noise_std: config.process_noise_std,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.state[0], self.state[1], self.state[2])
    }

    pub fn velocity(&self) -> Vec3 {
        Vec3::new(self.state[3], self.state[4], self.state[5])
    }

    pub fn covariance(&self) -> &StateCov {
        &self.cov
    }

    /// Build state transition matrix F for timestep dt.
    pub fn transition_matrix(dt: f64) -> Matrix6<f64> {
        let mut f = Matrix6::<f64>::identity();
        f[(0, 3)] = dt;
        f[(1, 4)] = dt;
        f[(2, 5)] = dt;
        f
    }

    fn process_noise(dt: f64, q_std: f64) -> Matrix6<f64> {
        let q = q_std * q_std;
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt3 * dt;
        let mut qm = Matrix6::<f64>::zeros();
        for i in 0..3usize {
            qm[(i, i)] = q * dt4 / 4.0;
            qm[(i + 3, i + 3)] = q * dt2;
            qm[(i, i + 3)] = q * dt3 / 2.0;
            qm[(i + 3, i)] = q * dt3 / 2.0;
        }
        qm
    }

    /// Propagate the filter forward to `timestamp`. Earlier times are ignored.
    pub fn predict_to(&mut self, timestamp: f64) {
        let dt = timestamp - self.timestamp;
        if dt <= TIME_EPS {
            return;
        }
        let f = Self::transition_matrix(dt);
        let q = Self::process_noise(dt, self.process_noise_std);
        self.state = f * self.state;
        self.cov = f * self.cov * f.transpose() + q;
        self.timestamp = timestamp;
    }

    /// Fused centre/velocity extrapolated to `timestamp` without mutating the filter.
    pub fn extrapolate(&self, timestamp: f64) -> (Vec3, Vec3) {
        let dt = (timestamp - self.timestamp).max(0.0);
        let x = Self::transition_matrix(dt) * self.state;
        (Vec3::new(x[0], x[1], x[2]), Vec3::new(x[3], x[4], x[5]))
    }

    /// Predict to the detection time and apply it. Returns `false` when the
    /// detection is out of order or the innovation covariance is singular.
    pub fn update(
        &mut self,
        geometry: &Geometry,
        timestamp: f64,
        family: &SensorFamilyConfig,
    ) -> bool {
        if timestamp + TIME_EPS < self.timestamp {
            return false;
        }
        self.predict_to(timestamp);

        let dim = if family.measures_velocity { 6 } else { 3 };
        let h = DMat::from_fn(dim, 6, |r, c| if r == c { 1.0 } else { 0.0 });
        let c = geometry.center;
        let v = geometry.velocity;
        let z = if family.measures_velocity {
            DVec::from_vec(vec![c[0], c[1], c[2], v[0], v[1], v[2]])
        } else {
            DVec::from_vec(vec![c[0], c[1], c[2]])
        };
        let ps = family.position_noise_std * family.position_noise_std;
        let vs = family.velocity_noise_std * family.velocity_noise_std;
        let r = DMat::from_fn(dim, dim, |i, j| match (i == j, i < 3) {
            (true, true) => ps,
            (true, false) => vs,
            _ => 0.0,
        });

        let x_dyn = DVec::from_iterator(6, self.state.iter().copied());
        let p_dyn = DMat::from_fn(6, 6, |i, j| self.cov[(i, j)]);

        // Innovation: ν = z − H·x
        let innovation = z - &h * &x_dyn;
        // Innovation covariance: S = H·P·Hᵀ + R
        let s = &h * &p_dyn * h.transpose() + &r;
        let Some(s_inv) = s.lu().try_inverse() else {
            warn!(timestamp, "singular innovation covariance, skipping motion update");
            return false;
        };
        // Kalman gain: K = P·Hᵀ·S⁻¹
        let k = &p_dyn * h.transpose() * s_inv;

        let correction = &k * innovation;
        self.state = StateVec::from_fn(|i, _| self.state[i] + correction[i]);

        // Joseph form P' = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ
        let i_kh = DMat::identity(6, 6) - &k * &h;
        let new_p = &i_kh * &p_dyn * i_kh.transpose() + &k * &r * k.transpose();
        self.cov = StateCov::from_fn(|i, j| new_p[(i, j)]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn predict_constant_velocity() {
        let mut g = Geometry::at(0.0, 0.0);
        g.velocity = Vec3::new(10.0, 0.0, 0.0);
        let mut mf = MotionFusion::new(
            &g,
            0.0,
            &SensorFamilyConfig::radar(),
            &MotionConfig::default(),
        );
        mf.predict_to(1.0);
        assert_abs_diff_eq!(mf.position()[0], 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(mf.velocity()[0], 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(mf.timestamp(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn update_reduces_uncertainty_and_pulls_toward_measurement() {
        let lidar = SensorFamilyConfig::lidar();
        let mut mf = MotionFusion::new(&Geometry::at(0.0, 0.0), 0.0, &lidar, &MotionConfig::default());
        let prior_trace = mf.covariance().trace();
        mf.predict_to(0.1);
        let predicted_trace = mf.covariance().trace();
        assert!(predicted_trace > prior_trace);

        assert!(mf.update(&Geometry::at(1.0, 0.5), 0.1, &lidar));
        assert!(mf.covariance().trace() < predicted_trace);
        assert!(mf.position()[0] > 0.5 && mf.position()[0] <= 1.0);
    }

    #[test]
    fn out_of_order_detection_is_not_applied() {
        let lidar = SensorFamilyConfig::lidar();
        let mut mf = MotionFusion::new(&Geometry::at(0.0, 0.0), 0.5, &lidar, &MotionConfig::default());
        assert!(!mf.update(&Geometry::at(5.0, 5.0), 0.4, &lidar));
        assert_abs_diff_eq!(mf.position()[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mf.timestamp(), 0.5, epsilon = 1e-12);
    }
}
