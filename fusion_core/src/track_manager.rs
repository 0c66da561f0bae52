//! Track lifecycle management: birth, per-sensor hit/miss routing, death,
//! recently-dead history, publish gating.
//!
//! # Cycle policy
//! - Frames are applied in ascending timestamp order (ties keep arrival order).
//! - **Hit**: a detection matched to a live track updates that track.
//! - **Revival**: a detection matched to a track that died less than
//!   `dead_grace_period` ago moves it back to the live set.
//! - **Birth**: an unmatched detection, or one matched to an unknown id,
//!   spawns a new track.
//! - **Miss**: every live track not updated by a frame receives a
//!   "no detection" update for that frame's sensor.
//! - **Death**: after all frames, dead tracks leave the live set for the
//!   bounded history; stale history entries are dropped.

use crate::{
    config::FusionConfig,
    dst::BeliefLatticeContext,
    error::FusionError,
    track::{FusedObject, FusionContext, Track, TrackIdAllocator},
    types::{DetectedObject, SensorDetection, SensorId, SensorType, TrackId},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// Association cost reported with a "no detection" update.
pub const MISS_COST: f64 = f64::MAX;

// ---------------------------------------------------------------------------
// Cycle I/O
// ---------------------------------------------------------------------------

/// One detection plus the association decision for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssociatedDetection {
    /// `None` models a detection that arrived without its object payload.
    pub object: Option<DetectedObject>,
    pub matched_track: Option<TrackId>,
    pub association_cost: f64,
}

impl AssociatedDetection {
    pub fn unmatched(object: DetectedObject) -> Self {
        Self {
            object: Some(object),
            matched_track: None,
            association_cost: 0.0,
        }
    }

    pub fn matched(object: DetectedObject, track: TrackId, association_cost: f64) -> Self {
        Self {
            object: Some(object),
            matched_track: Some(track),
            association_cost,
        }
    }
}

/// All detections one sensor produced for one cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorFrame {
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    pub timestamp: f64,
    pub detections: Vec<AssociatedDetection>,
}

impl SensorFrame {
    pub fn new(sensor_type: SensorType, sensor_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            sensor_type,
            sensor_id: SensorId::new(sensor_id),
            timestamp,
            detections: Vec::new(),
        }
    }

    pub fn with(mut self, detection: AssociatedDetection) -> Self {
        self.detections.push(detection);
        self
    }
}

/// A track created during a cycle, with the detection that created it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Birth {
    pub track_id: TrackId,
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    pub source_track_hint: Option<u64>,
}

/// Result of one fusion pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CycleOutput {
    pub timestamp: f64,
    /// Publishable tracks in ascending id order.
    pub published: Vec<FusedObject>,
    pub births: Vec<Birth>,
    pub deaths: Vec<TrackId>,
    pub revived: Vec<TrackId>,
    /// Detections dropped before reaching a track.
    pub rejected: usize,
}

#[derive(Clone, Debug)]
struct DeadTrack {
    track: Track,
    died_at: f64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every live track in a dense container, the id allocator and the
/// recently-dead history.
#[derive(Debug)]
pub struct TrackManager {
    config: FusionConfig,
    ctx: Arc<FusionContext>,
    ids: TrackIdAllocator,
    tracks: Vec<Track>,
    index: HashMap<TrackId, usize>,
    dead: VecDeque<DeadTrack>,
}

impl TrackManager {
    /// Validate `config` and build a manager. A family missing from the
    /// configuration table is a [`FusionError::ConfigurationError`].
    pub fn new(
        config: FusionConfig,
        lattice: Arc<BeliefLatticeContext>,
        ids: TrackIdAllocator,
    ) -> Result<Self, FusionError> {
        let ctx = Arc::new(FusionContext::new(lattice, &config)?);
        Ok(Self {
            config,
            ctx,
            ids,
            tracks: Vec::new(),
            index: HashMap::new(),
            dead: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<FusionContext> {
        &self.ctx
    }

    pub fn ids(&self) -> &TrackIdAllocator {
        &self.ids
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.index.get(&id).map(|&i| &self.tracks[i])
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Ids in the recently-dead history, oldest first.
    pub fn recently_dead(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.dead.iter().map(|d| d.track.id())
    }

    /// Drop every track and restart ids at `base`.
    pub fn reset(&mut self, base: u64) {
        self.tracks.clear();
        self.index.clear();
        self.dead.clear();
        self.ids.reset(base);
    }

    /// Create a track from an unmatched detection.
    pub fn create_track(&mut self, detection: SensorDetection) -> Result<TrackId, FusionError> {
        let track = Track::new(detection, &self.ids, Arc::clone(&self.ctx))?;
        let id = track.id();
        self.insert(track);
        Ok(id)
    }

    fn insert(&mut self, track: Track) {
        self.index.insert(track.id(), self.tracks.len());
        self.tracks.push(track);
    }

    // -----------------------------------------------------------------------
    // Cycle
    // -----------------------------------------------------------------------

    /// Apply one cycle's frames and return the publishable set.
    pub fn process_cycle(
        &mut self,
        timestamp: f64,
        mut frames: Vec<SensorFrame>,
    ) -> Result<CycleOutput, FusionError> {
        let mut out = CycleOutput {
            timestamp,
            ..Default::default()
        };
        frames.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        for frame in frames {
            self.process_frame(frame, &mut out)?;
        }
        // Silent sensors must still age tracks out.
        self.tracks
            .par_iter_mut()
            .try_for_each(|track| track.advance_to(timestamp))?;
        self.retire_dead(timestamp, &mut out);
        out.published = self.publishable()?;
        trace!(
            t = timestamp,
            live = self.tracks.len(),
            published = out.published.len(),
            births = out.births.len(),
            deaths = out.deaths.len(),
            "cycle done"
        );
        Ok(out)
    }

    fn process_frame(&mut self, frame: SensorFrame, out: &mut CycleOutput) -> Result<(), FusionError> {
        let SensorFrame {
            sensor_type,
            sensor_id,
            timestamp,
            detections,
        } = frame;
        let mut updated = vec![false; self.tracks.len()];

        for assoc in detections {
            let Some(object) = assoc.object else {
                warn!(sensor = %sensor_id, t = timestamp, "detection without object payload rejected");
                out.rejected += 1;
                continue;
            };
            let detection = match SensorDetection::new(sensor_type, sensor_id.clone(), timestamp, object) {
                Ok(d) => d,
                Err(FusionError::MalformedDetection(reason)) => {
                    warn!(sensor = %sensor_id, t = timestamp, %reason, "malformed detection rejected");
                    out.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let target = match assoc.matched_track {
                Some(id) => self.resolve(id, timestamp, out),
                None => None,
            };
            match target {
                Some(i) => {
                    self.tracks[i].update_with_sensor_object(detection, assoc.association_cost)?;
                    if i >= updated.len() {
                        updated.resize(i + 1, false);
                    }
                    updated[i] = true;
                }
                None => {
                    let hint = detection.source_track_hint();
                    let id = self.create_track(detection)?;
                    out.births.push(Birth {
                        track_id: id,
                        sensor_type,
                        sensor_id: sensor_id.clone(),
                        source_track_hint: hint,
                    });
                    updated.resize(self.tracks.len(), false);
                    updated[self.tracks.len() - 1] = true;
                }
            }
        }
        updated.resize(self.tracks.len(), false);

        // Misses are independent per track.
        self.tracks
            .par_iter_mut()
            .zip(updated.par_iter())
            .filter(|(_, hit)| !**hit)
            .try_for_each(|(track, _)| {
                track.update_without_sensor_object(sensor_type, &sensor_id, MISS_COST, timestamp)
            })
    }

    /// Dense index of the track a matched detection should update, reviving
    /// it from the history when needed. `None` means "spawn a new track".
    fn resolve(&mut self, id: TrackId, timestamp: f64, out: &mut CycleOutput) -> Option<usize> {
        if let Some(&i) = self.index.get(&id) {
            return Some(i);
        }
        let grace = self.config.dead_grace_period;
        let pos = self
            .dead
            .iter()
            .position(|d| d.track.id() == id && timestamp - d.died_at <= grace);
        match pos.and_then(|p| self.dead.remove(p)) {
            Some(dead) => {
                debug!(track = %id, t = timestamp, "late detection revives track");
                out.revived.push(id);
                self.insert(dead.track);
                Some(self.tracks.len() - 1)
            }
            None => {
                warn!(track = %id, t = timestamp, "detection matched to unknown track, spawning new one");
                None
            }
        }
    }

    fn retire_dead(&mut self, now: f64, out: &mut CycleOutput) {
        if self.tracks.iter().any(Track::is_dead) {
            let (dead, live): (Vec<Track>, Vec<Track>) =
                self.tracks.drain(..).partition(Track::is_dead);
            self.tracks = live;
            self.index = self
                .tracks
                .iter()
                .enumerate()
                .map(|(i, t)| (t.id(), i))
                .collect();
            for track in dead {
                debug!(track = %track.id(), t = now, "track retired");
                out.deaths.push(track.id());
                self.dead.push_back(DeadTrack { track, died_at: now });
            }
        }

        let grace = self.config.dead_grace_period;
        while self.dead.front().is_some_and(|d| now - d.died_at > grace) {
            self.dead.pop_front();
        }
        while self.dead.len() > self.config.dead_history_len {
            self.dead.pop_front();
        }
    }

    /// Snapshot of every publishable live track, ascending by id.
    pub fn publishable(&self) -> Result<Vec<FusedObject>, FusionError> {
        let mut published = self
            .tracks
            .iter()
            .filter(|t| t.able_to_publish())
            .map(Track::to_fused_object)
            .collect::<Result<Vec<_>, _>>()?;
        published.sort_by_key(|o| o.track_id);
        Ok(published)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassProbs, Geometry, ObjectClass};
    use approx::assert_abs_diff_eq;

    fn manager() -> TrackManager {
        manager_with(FusionConfig::default())
    }

    fn manager_with(config: FusionConfig) -> TrackManager {
        TrackManager::new(
            config,
            BeliefLatticeContext::initialized_object_classes(),
            TrackIdAllocator::default(),
        )
        .unwrap()
    }

    fn object(class: ObjectClass) -> DetectedObject {
        DetectedObject::new(Geometry::at(20.0, -3.0), ClassProbs::certain(class))
    }

    fn lidar(t: f64) -> SensorFrame {
        SensorFrame::new(SensorType::Lidar, "velodyne_64", t)
    }

    #[test]
    fn missing_family_fails_at_construction() {
        let mut config = FusionConfig::default();
        config.families.0.remove(&SensorType::Radar);
        let res = TrackManager::new(
            config,
            BeliefLatticeContext::initialized_object_classes(),
            TrackIdAllocator::default(),
        );
        assert!(matches!(res, Err(FusionError::ConfigurationError(_))));
    }

    #[test]
    fn uninitialized_lattice_fails_fast_on_birth() {
        let mut mgr = TrackManager::new(
            FusionConfig::default(),
            Arc::new(BeliefLatticeContext::object_classes()),
            TrackIdAllocator::default(),
        )
        .unwrap();
        let frame = lidar(0.1).with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)));
        assert_eq!(
            mgr.process_cycle(0.1, vec![frame]).err(),
            Some(FusionError::UninitializedFusionState)
        );
    }

    #[test]
    fn ids_follow_creation_order_after_reset() {
        let mut mgr = manager();
        mgr.reset(0);
        let frame = lidar(0.1)
            .with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)))
            .with(AssociatedDetection::unmatched(object(ObjectClass::Pedestrian)));
        let out = mgr.process_cycle(0.1, vec![frame]).unwrap();
        let ids: Vec<_> = out.births.iter().map(|b| b.track_id).collect();
        assert_eq!(ids, vec![TrackId(0), TrackId(1)]);
        assert_eq!(out.published.len(), 2, "lidar births publish immediately");
        assert_abs_diff_eq!(out.published[0].timestamp, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn missing_payload_is_rejected_and_cycle_continues() {
        let mut mgr = manager();
        let frame = lidar(0.1)
            .with(AssociatedDetection {
                object: None,
                matched_track: None,
                association_cost: 0.0,
            })
            .with(AssociatedDetection::unmatched(object(ObjectClass::Bicycle)));
        let out = mgr.process_cycle(0.1, vec![frame]).unwrap();
        assert_eq!(out.rejected, 1);
        assert_eq!(out.births.len(), 1);
    }

    #[test]
    fn malformed_class_probabilities_are_rejected() {
        let mut mgr = manager();
        let bad = DetectedObject::new(Geometry::at(0.0, 0.0), ClassProbs([0.0; ObjectClass::COUNT]));
        let out = mgr
            .process_cycle(0.1, vec![lidar(0.1).with(AssociatedDetection::unmatched(bad))])
            .unwrap();
        assert_eq!(out.rejected, 1);
        assert!(mgr.is_empty());
    }

    #[test]
    fn radar_only_track_waits_for_corroboration() {
        let mut mgr = manager();
        let radar = SensorFrame::new(SensorType::Radar, "radar_front", 0.0)
            .with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)));
        let out = mgr.process_cycle(0.0, vec![radar]).unwrap();
        assert!(out.published.is_empty());
        let id = out.births[0].track_id;

        let camera = SensorFrame::new(SensorType::Camera, "camera_front", 0.05)
            .with(AssociatedDetection::matched(object(ObjectClass::Vehicle), id, 0.4));
        let out = mgr.process_cycle(0.05, vec![camera]).unwrap();
        assert_eq!(out.published.len(), 1);
        assert_eq!(out.published[0].track_id, id);
        assert_eq!(out.published[0].dominant_class, ObjectClass::Vehicle);
    }

    #[test]
    fn unmatched_tracks_receive_misses_and_die() {
        let mut mgr = manager();
        let out = mgr
            .process_cycle(0.0, vec![lidar(0.0).with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)))])
            .unwrap();
        let id = out.births[0].track_id;

        let out = mgr.process_cycle(0.2, vec![lidar(0.2)]).unwrap();
        assert!(out.deaths.is_empty());
        assert_eq!(out.published.len(), 1);

        let out = mgr.process_cycle(0.3, vec![lidar(0.3)]).unwrap();
        assert_eq!(out.deaths, vec![id]);
        assert!(out.published.is_empty());
        assert!(mgr.track(id).is_none());
        assert_eq!(mgr.recently_dead().collect::<Vec<_>>(), vec![id]);
    }

    #[test]
    fn empty_cycles_still_retire_silent_tracks() {
        let mut mgr = manager();
        let out = mgr
            .process_cycle(0.0, vec![lidar(0.0).with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)))])
            .unwrap();
        let id = out.births[0].track_id;

        let mut died_at = None;
        for k in 1..=100 {
            let t = k as f64 * 0.1;
            let out = mgr.process_cycle(t, vec![]).unwrap();
            if out.deaths.contains(&id) {
                died_at = Some(t);
            }
            if died_at.is_some() {
                assert!(out.published.is_empty(), "dead track published at t={t}");
            }
        }
        let died_at = died_at.expect("track with no evidence never died");
        assert!(died_at < 0.35);
        assert!(mgr.is_empty());
    }

    #[test]
    fn late_detection_revives_recently_dead_track() {
        let mut mgr = manager();
        let out = mgr
            .process_cycle(0.0, vec![lidar(0.0).with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)))])
            .unwrap();
        let id = out.births[0].track_id;
        mgr.process_cycle(0.3, vec![lidar(0.3)]).unwrap();
        assert!(mgr.track(id).is_none());

        let frame = lidar(0.35).with(AssociatedDetection::matched(object(ObjectClass::Vehicle), id, 0.2));
        let out = mgr.process_cycle(0.35, vec![frame]).unwrap();
        assert_eq!(out.revived, vec![id]);
        assert!(out.births.is_empty());
        assert!(mgr.track(id).is_some_and(|t| !t.is_dead()));
        assert_eq!(mgr.recently_dead().count(), 0);
    }

    #[test]
    fn history_respects_grace_and_capacity() {
        let config = FusionConfig {
            dead_history_len: 1,
            dead_grace_period: 0.5,
            ..FusionConfig::default()
        };
        let mut mgr = manager_with(config);
        let frame = lidar(0.0)
            .with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)))
            .with(AssociatedDetection::unmatched(object(ObjectClass::Other)));
        mgr.process_cycle(0.0, vec![frame]).unwrap();
        let out = mgr.process_cycle(0.3, vec![lidar(0.3)]).unwrap();
        assert_eq!(out.deaths.len(), 2);
        assert_eq!(mgr.recently_dead().count(), 1, "capacity bounds the history");

        mgr.process_cycle(0.9, vec![]).unwrap();
        assert_eq!(mgr.recently_dead().count(), 0, "grace period elapsed");

        let stale = lidar(0.9).with(AssociatedDetection::matched(
            object(ObjectClass::Vehicle),
            out.deaths[1],
            0.1,
        ));
        let out = mgr.process_cycle(0.9, vec![stale]).unwrap();
        assert!(out.revived.is_empty());
        assert_eq!(out.births.len(), 1);
    }

    #[test]
    fn frames_apply_in_timestamp_order() {
        let mut mgr = manager();
        let out = mgr
            .process_cycle(0.0, vec![lidar(0.0).with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)))])
            .unwrap();
        let id = out.births[0].track_id;
        let late = lidar(0.2).with(AssociatedDetection::matched(object(ObjectClass::Vehicle), id, 0.1));
        let early = SensorFrame::new(SensorType::Radar, "radar_front", 0.1);
        let out = mgr.process_cycle(0.2, vec![late, early]).unwrap();
        assert_abs_diff_eq!(out.published[0].timestamp, 0.2, epsilon = 1e-12);
        let track = mgr.track(id).unwrap();
        assert_abs_diff_eq!(
            track.invisible_period(&"radar_front".into()).unwrap(),
            0.1,
            epsilon = 1e-12
        );
    }

    #[test]
    fn published_output_is_sorted_by_track_id() {
        let mut mgr = manager();
        let frame = lidar(0.0)
            .with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)))
            .with(AssociatedDetection::unmatched(object(ObjectClass::Vehicle)));
        let out = mgr.process_cycle(0.0, vec![frame]).unwrap();
        let first = out.births[0].track_id;
        mgr.process_cycle(0.3, vec![lidar(0.3).with(AssociatedDetection::matched(
            object(ObjectClass::Vehicle),
            out.births[1].track_id,
            0.1,
        ))])
        .unwrap();
        let out = mgr
            .process_cycle(0.35, vec![lidar(0.35).with(AssociatedDetection::matched(
                object(ObjectClass::Vehicle),
                first,
                0.1,
            ))])
            .unwrap();
        assert_eq!(out.revived, vec![first]);
        let ids: Vec<_> = out.published.iter().map(|o| o.track_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.len(), 2);
    }
}
