//! `sim` — Scenario simulator: road users, lidar/radar/camera detections,
//! oracle association, replay.

pub mod oracle;
pub mod replay;
pub mod runner;
pub mod scenarios;
pub mod sensor_sim;
pub mod target;

pub use oracle::OracleAssociator;
pub use replay::{load_replay, save_replay, ReplayCycle, ReplayLog};
pub use runner::{FusionRun, Simulation};
pub use scenarios::{Scenario, ScenarioKind};
pub use sensor_sim::{RawFrame, SensorSimulator, SimSensor, SimSensorParams};
pub use target::{MotionSpec, Target};
