//! Pipeline orchestrator: hand-off from sensor threads into one fusion pass.
//!
//! # Threading model
//! 1. Sensor threads only call [`SensorHandle::submit`], which appends a frame
//!    to the shared [`FrameBuffer`] under a short lock.
//! 2. The cycle clock calls [`FrameBuffer::begin_cycle`] to seal the pending
//!    frames into the batch for the next pass. A sealed batch nobody took
//!    before the next `begin_cycle` is superseded and dropped.
//! 3. The fusion thread calls [`FusionPipeline::run_cycle`], which holds the
//!    manager lock for the whole pass, so a cycle's output becomes visible
//!    atomically through [`FusionPipeline::latest_output`].

use crate::{
    error::FusionError,
    track_manager::{CycleOutput, SensorFrame, TrackManager},
    types::{SensorId, SensorType},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{mem, sync::Arc, time::Instant};
use tracing::{trace, warn};

// ---------------------------------------------------------------------------
// Frame buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FrameQueue {
    pending: Vec<SensorFrame>,
    sealed: Option<Vec<SensorFrame>>,
    superseded: u64,
}

/// Frames submitted by sensor threads, waiting for the next fusion pass.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    queue: Mutex<FrameQueue>,
}

impl FrameBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle a sensor thread uses to submit its frames.
    pub fn handle(self: &Arc<Self>, sensor_type: SensorType, sensor_id: impl Into<String>) -> SensorHandle {
        SensorHandle {
            buffer: Arc::clone(self),
            sensor_type,
            sensor_id: SensorId::new(sensor_id),
        }
    }

    pub fn submit(&self, frame: SensorFrame) {
        self.queue.lock().pending.push(frame);
    }

    /// Seal everything submitted so far as the next batch. Returns the
    /// number of sealed frames.
    pub fn begin_cycle(&self) -> usize {
        let mut q = self.queue.lock();
        let batch = mem::take(&mut q.pending);
        let n = batch.len();
        if let Some(stale) = q.sealed.replace(batch) {
            q.superseded += 1;
            warn!(frames = stale.len(), "previous cycle not consumed, superseded");
        }
        n
    }

    /// Take the sealed batch, leaving nothing sealed.
    pub fn take_sealed(&self) -> Vec<SensorFrame> {
        self.queue.lock().sealed.take().unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Cycles dropped because they were never consumed.
    pub fn superseded_cycles(&self) -> u64 {
        self.queue.lock().superseded
    }
}

/// Submission endpoint bound to one physical sensor.
#[derive(Clone, Debug)]
pub struct SensorHandle {
    buffer: Arc<FrameBuffer>,
    sensor_type: SensorType,
    sensor_id: SensorId,
}

impl SensorHandle {
    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    /// Empty frame stamped with this sensor's identity.
    pub fn frame_at(&self, timestamp: f64) -> SensorFrame {
        SensorFrame::new(self.sensor_type, self.sensor_id.as_str(), timestamp)
    }

    pub fn submit(&self, frame: SensorFrame) {
        if frame.sensor_id != self.sensor_id || frame.sensor_type != self.sensor_type {
            warn!(
                handle = %self.sensor_id,
                frame = %frame.sensor_id,
                "frame submitted through another sensor's handle"
            );
        }
        self.buffer.submit(frame);
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Counters for the cycle loop.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub cycles: u64,
    pub frames: u64,
    pub superseded: u64,
    /// Wall-clock time of the last pass.
    pub last_cycle_us: u64,
}

/// The fusion pass plus the buffer feeding it.
#[derive(Debug)]
pub struct FusionPipeline {
    buffer: Arc<FrameBuffer>,
    manager: Mutex<TrackManager>,
    latest: Mutex<Option<Arc<CycleOutput>>>,
    stats: Mutex<PipelineStats>,
}

impl FusionPipeline {
    pub fn new(manager: TrackManager) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            manager: Mutex::new(manager),
            latest: Mutex::new(None),
            stats: Mutex::new(PipelineStats::default()),
        }
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn sensor(&self, sensor_type: SensorType, sensor_id: impl Into<String>) -> SensorHandle {
        self.buffer.handle(sensor_type, sensor_id)
    }

    /// Run one fusion pass over the sealed batch.
    pub fn run_cycle(&self, timestamp: f64) -> Result<Arc<CycleOutput>, FusionError> {
        let start = Instant::now();
        let mut manager = self.manager.lock();
        let frames = self.buffer.take_sealed();
        let n_frames = frames.len() as u64;
        let output = Arc::new(manager.process_cycle(timestamp, frames)?);
        *self.latest.lock() = Some(Arc::clone(&output));
        drop(manager);

        let mut stats = self.stats.lock();
        stats.cycles += 1;
        stats.frames += n_frames;
        stats.superseded = self.buffer.superseded_cycles();
        stats.last_cycle_us = start.elapsed().as_micros() as u64;
        trace!(t = timestamp, frames = n_frames, us = stats.last_cycle_us, "fusion pass");
        Ok(output)
    }

    /// Seal and fuse in one call, for single-threaded drivers.
    pub fn step(&self, timestamp: f64) -> Result<Arc<CycleOutput>, FusionError> {
        self.buffer.begin_cycle();
        self.run_cycle(timestamp)
    }

    /// Output of the last completed pass.
    pub fn latest_output(&self) -> Option<Arc<CycleOutput>> {
        self.latest.lock().clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    /// Inspect the manager between passes.
    pub fn with_manager<R>(&self, f: impl FnOnce(&TrackManager) -> R) -> R {
        f(&self.manager.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FusionConfig,
        dst::BeliefLatticeContext,
        track::TrackIdAllocator,
        track_manager::AssociatedDetection,
        types::{ClassProbs, DetectedObject, Geometry, ObjectClass},
    };
    use std::thread;

    fn pipeline() -> FusionPipeline {
        let manager = TrackManager::new(
            FusionConfig::default(),
            BeliefLatticeContext::initialized_object_classes(),
            TrackIdAllocator::default(),
        )
        .unwrap();
        FusionPipeline::new(manager)
    }

    fn object(x: f64) -> AssociatedDetection {
        AssociatedDetection::unmatched(DetectedObject::new(
            Geometry::at(x, 0.0),
            ClassProbs::certain(ObjectClass::Vehicle),
        ))
    }

    #[test]
    fn concurrent_sensors_feed_one_pass() {
        let pipe = pipeline();
        let handles = [
            pipe.sensor(SensorType::Lidar, "lidar_top"),
            pipe.sensor(SensorType::Radar, "radar_front"),
            pipe.sensor(SensorType::Camera, "camera_front"),
        ];
        thread::scope(|s| {
            for (k, handle) in handles.iter().enumerate() {
                s.spawn(move || {
                    for i in 0..4 {
                        let t = 0.01 * (i * 3 + k) as f64;
                        handle.submit(handle.frame_at(t).with(object(10.0 * k as f64)));
                    }
                });
            }
        });
        assert_eq!(pipe.buffer().pending_len(), 12);

        let out = pipe.step(0.2).unwrap();
        assert_eq!(out.births.len(), 12);
        assert_eq!(pipe.with_manager(|m| m.len()), 12);
        assert_eq!(pipe.stats().frames, 12);
        assert!(Arc::ptr_eq(&out, &pipe.latest_output().unwrap()));
    }

    #[test]
    fn unconsumed_cycle_is_superseded() {
        let pipe = pipeline();
        let lidar = pipe.sensor(SensorType::Lidar, "lidar_top");
        lidar.submit(lidar.frame_at(0.0).with(object(1.0)));
        assert_eq!(pipe.buffer().begin_cycle(), 1);

        lidar.submit(lidar.frame_at(0.1).with(object(2.0)));
        lidar.submit(lidar.frame_at(0.1).with(object(3.0)));
        assert_eq!(pipe.buffer().begin_cycle(), 2);
        assert_eq!(pipe.buffer().superseded_cycles(), 1);

        let out = pipe.run_cycle(0.1).unwrap();
        assert_eq!(out.births.len(), 2);
        assert_eq!(pipe.stats().superseded, 1);
    }

    #[test]
    fn passes_without_frames_age_tracks_out() {
        let pipe = pipeline();
        let lidar = pipe.sensor(SensorType::Lidar, "lidar_top");
        lidar.submit(lidar.frame_at(0.0).with(object(5.0)));
        assert_eq!(pipe.step(0.0).unwrap().published.len(), 1);

        assert_eq!(pipe.step(0.1).unwrap().published.len(), 1);
        let out = pipe.step(0.4).unwrap();
        assert_eq!(out.deaths.len(), 1);
        assert!(out.published.is_empty());
        assert_eq!(pipe.with_manager(|m| m.len()), 0);
    }

    #[test]
    fn no_output_before_first_pass() {
        let pipe = pipeline();
        assert!(pipe.latest_output().is_none());
        let out = pipe.run_cycle(0.0).unwrap();
        assert!(out.published.is_empty());
        assert_eq!(pipe.stats().cycles, 1);
    }
}
