//! Ground-truth association for simulation.
//!
//! The fusion core expects detections already paired with tracks. In
//! simulation every true detection carries its target id as
//! `source_track_hint`, so pairing reduces to a lookup from target id to the
//! track created for it.
//!
//! Tracks born during a cycle do not exist yet when that cycle's frames are
//! associated. The oracle predicts their ids: the manager applies frames in
//! timestamp order and hands out ids sequentially, so the k-th new track of
//! the cycle receives `next_id + k`. Later detections of the same target in
//! the same cycle are matched to the predicted id. Births reported back
//! through [`OracleAssociator::observe`] are authoritative and overwrite any
//! prediction.

use crate::sensor_sim::RawFrame;
use fusion_core::{AssociatedDetection, CycleOutput, SensorFrame, TrackId};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Debug)]
struct DeadEntry {
    target: Option<u64>,
    track: TrackId,
    died_at: f64,
}

/// Mirrors the manager's live set and recently-dead history by target id.
#[derive(Clone, Debug)]
pub struct OracleAssociator {
    live: HashMap<u64, TrackId>,
    owner: HashMap<TrackId, u64>,
    dead: VecDeque<DeadEntry>,
    revivals: HashMap<u64, TrackId>,
    grace: f64,
    history_len: usize,
}

impl OracleAssociator {
    pub fn new(dead_grace_period: f64, dead_history_len: usize) -> Self {
        Self {
            live: HashMap::new(),
            owner: HashMap::new(),
            dead: VecDeque::new(),
            revivals: HashMap::new(),
            grace: dead_grace_period,
            history_len: dead_history_len,
        }
    }

    /// Track currently associated with `target`, if any.
    pub fn track_of(&self, target: u64) -> Option<TrackId> {
        self.live.get(&target).copied()
    }

    /// Pair every detection of this cycle with a track. `next_id` is the id
    /// the manager will give its next new track.
    pub fn associate(&mut self, mut raw: Vec<RawFrame>, next_id: TrackId) -> Vec<SensorFrame> {
        raw.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        let mut next = next_id.0;
        let mut predicted: HashMap<u64, TrackId> = HashMap::new();
        self.revivals.clear();

        let mut frames = Vec::with_capacity(raw.len());
        for frame in raw {
            let mut out = SensorFrame::new(frame.sensor_type, frame.sensor_id.as_str(), frame.timestamp);
            for object in frame.objects {
                let matched = match object.source_track_hint {
                    Some(target) => self.lookup(target, frame.timestamp, &predicted),
                    None => None,
                };
                let assoc = match matched {
                    Some(track) => AssociatedDetection::matched(object, track, 0.0),
                    None => {
                        if let Some(target) = object.source_track_hint {
                            predicted.insert(target, TrackId(next));
                        }
                        next += 1;
                        AssociatedDetection::unmatched(object)
                    }
                };
                out.detections.push(assoc);
            }
            frames.push(out);
        }
        frames
    }

    fn lookup(
        &mut self,
        target: u64,
        timestamp: f64,
        predicted: &HashMap<u64, TrackId>,
    ) -> Option<TrackId> {
        let known = self
            .live
            .get(&target)
            .or_else(|| predicted.get(&target))
            .or_else(|| self.revivals.get(&target))
            .copied();
        known.or_else(|| self.revive(target, timestamp))
    }

    fn revive(&mut self, target: u64, timestamp: f64) -> Option<TrackId> {
        let pos = self
            .dead
            .iter()
            .position(|d| d.target == Some(target) && timestamp - d.died_at <= self.grace)?;
        let entry = self.dead.remove(pos)?;
        self.revivals.insert(target, entry.track);
        Some(entry.track)
    }

    /// Update the mirror from the manager's report for the cycle.
    pub fn observe(&mut self, output: &CycleOutput) {
        for (&target, &track) in &self.revivals {
            if output.revived.contains(&track) {
                self.live.insert(target, track);
                self.owner.insert(track, target);
            }
        }
        self.revivals.clear();

        for birth in &output.births {
            if let Some(target) = birth.source_track_hint {
                if let Some(old) = self.live.insert(target, birth.track_id) {
                    self.owner.remove(&old);
                }
                self.owner.insert(birth.track_id, target);
            }
        }

        for &track in &output.deaths {
            let target = self.owner.remove(&track);
            if let Some(t) = target {
                if self.live.get(&t) == Some(&track) {
                    self.live.remove(&t);
                }
            }
            self.dead.push_back(DeadEntry {
                target,
                track,
                died_at: output.timestamp,
            });
        }

        while self
            .dead
            .front()
            .is_some_and(|d| output.timestamp - d.died_at > self.grace)
        {
            self.dead.pop_front();
        }
        while self.dead.len() > self.history_len {
            self.dead.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_core::{
        BeliefLatticeContext, ClassProbs, DetectedObject, FusionConfig, Geometry, ObjectClass,
        SensorId, SensorType, TrackIdAllocator, TrackManager,
    };

    fn raw(sensor_type: SensorType, id: &str, t: f64, targets: &[u64]) -> RawFrame {
        RawFrame {
            sensor_type,
            sensor_id: SensorId::new(id),
            timestamp: t,
            objects: targets
                .iter()
                .map(|&target| {
                    DetectedObject::new(
                        Geometry::at(target as f64 * 10.0, 0.0),
                        ClassProbs::certain(ObjectClass::Vehicle),
                    )
                    .with_hint(target)
                })
                .collect(),
        }
    }

    #[test]
    fn same_cycle_detections_share_one_track() {
        let config = FusionConfig::default();
        let mut oracle = OracleAssociator::new(config.dead_grace_period, config.dead_history_len);
        let mut mgr = TrackManager::new(
            config,
            BeliefLatticeContext::initialized_object_classes(),
            TrackIdAllocator::default(),
        )
        .unwrap();

        let frames = vec![
            raw(SensorType::Radar, "radar_front", 0.05, &[7, 8]),
            raw(SensorType::Lidar, "lidar_top", 0.02, &[8]),
            raw(SensorType::Camera, "camera_front", 0.08, &[7]),
        ];
        let frames = oracle.associate(frames, mgr.ids().peek());
        let out = mgr.process_cycle(0.1, frames).unwrap();
        oracle.observe(&out);

        assert_eq!(out.births.len(), 2);
        assert_eq!(mgr.len(), 2);
        let t7 = oracle.track_of(7).unwrap();
        let t8 = oracle.track_of(8).unwrap();
        assert_ne!(t7, t8);
        assert_eq!(out.births[0].source_track_hint, Some(8));
        assert_eq!(
            mgr.track(t7).unwrap().contributing_families(),
            vec![SensorType::Radar, SensorType::Camera]
        );
    }

    #[test]
    fn dead_target_is_revived_within_grace() {
        let config = FusionConfig::default();
        let mut oracle = OracleAssociator::new(config.dead_grace_period, config.dead_history_len);
        let mut mgr = TrackManager::new(
            config,
            BeliefLatticeContext::initialized_object_classes(),
            TrackIdAllocator::default(),
        )
        .unwrap();

        let mut cycle = |mgr: &mut TrackManager, t: f64, frames: Vec<RawFrame>| {
            let frames = oracle.associate(frames, mgr.ids().peek());
            let out = mgr.process_cycle(t, frames).unwrap();
            oracle.observe(&out);
            out
        };
        cycle(&mut mgr, 0.0, vec![raw(SensorType::Lidar, "lidar_top", 0.0, &[1])]);
        let out = cycle(&mut mgr, 0.3, vec![raw(SensorType::Lidar, "lidar_top", 0.3, &[])]);
        assert_eq!(out.deaths.len(), 1);
        let out = cycle(&mut mgr, 0.4, vec![raw(SensorType::Lidar, "lidar_top", 0.4, &[1])]);
        assert_eq!(out.revived, vec![TrackId(0)]);
        assert!(out.births.is_empty());
        assert_eq!(oracle.track_of(1), Some(TrackId(0)));
    }
}
