//! `fusion_core` — Multi-sensor object fusion: track lifecycle and class
//! evidence fusion.
//!
//! # Module layout
//! - [`types`]        — Sensor / track ids, classes, geometry, `SensorDetection`
//! - [`error`]        — `FusionError`
//! - [`dst`]          — Belief lattice and Dempster-Shafer fusion engine
//! - [`motion`]       — Constant-velocity Kalman motion fusion
//! - [`config`]       — Per-family parameters, publish gating, decay
//! - [`track`]        — Track struct, per-sensor bookkeeping, id allocation
//! - [`track_manager`]— Birth / death / revival, cycle processing, publish set
//! - [`pipeline`]     — Sensor-thread hand-off and the locked fusion pass
//! - [`metrics`]      — Class accuracy, false positives, position RMSE

pub mod config;
pub mod dst;
pub mod error;
pub mod metrics;
pub mod motion;
pub mod pipeline;
pub mod track;
pub mod track_manager;
pub mod types;

pub use config::{FusionConfig, SensorFamilyConfig};
pub use dst::{Bba, BeliefFusionEngine, BeliefLatticeContext};
pub use error::FusionError;
pub use pipeline::{FrameBuffer, FusionPipeline, SensorHandle};
pub use track::{FusedObject, Track, TrackIdAllocator};
pub use track_manager::{AssociatedDetection, Birth, CycleOutput, SensorFrame, TrackManager};
pub use types::{
    ClassProbs, DetectedObject, Geometry, ObjectClass, SensorDetection, SensorId, SensorType,
    TrackId,
};
