//! Fusion quality metrics: class accuracy, false positives, position RMSE,
//! track churn.

use crate::{
    track_manager::CycleOutput,
    types::{ObjectClass, Vec3},
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Ground-truth state of one target at a given time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroundTruth {
    /// True target ID (from simulator)
    pub target_id: u64,
    pub time: f64,
    pub class: ObjectClass,
    pub position: Vec3,
    pub velocity: Vec3,
}

/// Accumulated metric statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FusionMetrics {
    pub cycles: u64,
    /// Published objects, summed over cycles
    pub published: u64,
    /// Published objects linked to a target whose class was right
    pub class_correct: u64,
    /// Published objects linked to a target whose class was wrong
    pub class_mismatch: u64,
    /// Published objects reporting `Unknown`, linked to a target
    pub class_unknown: u64,
    /// Published objects not linked to any target
    pub false_positives: u64,
    /// Targets with no published object
    pub missed_targets: u64,
    pub births: u64,
    pub deaths: u64,
    pub revivals: u64,
    pub rejected: u64,
    /// Sum of squared position errors (for RMSE)
    pub sum_sq_pos_err: f64,
    pub n_matched: u64,
}

impl FusionMetrics {
    /// Share of linked published objects with the correct class.
    pub fn class_accuracy(&self) -> f64 {
        let linked = self.class_correct + self.class_mismatch + self.class_unknown;
        if linked == 0 {
            return 1.0;
        }
        self.class_correct as f64 / linked as f64
    }

    /// Share of published objects not linked to a target.
    pub fn false_positive_rate(&self) -> f64 {
        if self.published == 0 {
            return 0.0;
        }
        self.false_positives as f64 / self.published as f64
    }

    /// Root-mean-square position error (meters, 3D).
    pub fn rmse_position(&self) -> f64 {
        if self.n_matched == 0 {
            return 0.0;
        }
        (self.sum_sq_pos_err / self.n_matched as f64).sqrt()
    }

    /// Accumulate one cycle. A published object is linked to the target named
    /// by the majority of its source hints.
    pub fn accumulate(&mut self, output: &CycleOutput, truth: &[GroundTruth]) {
        self.cycles += 1;
        self.published += output.published.len() as u64;
        self.births += output.births.len() as u64;
        self.deaths += output.deaths.len() as u64;
        self.revivals += output.revived.len() as u64;
        self.rejected += output.rejected as u64;

        let gt_map: HashMap<u64, &GroundTruth> = truth.iter().map(|g| (g.target_id, g)).collect();
        let mut seen = HashSet::new();

        for obj in &output.published {
            let mut votes: HashMap<u64, usize> = HashMap::new();
            for hint in obj.source_track_hints.iter().filter(|h| gt_map.contains_key(h)) {
                *votes.entry(*hint).or_default() += 1;
            }
            let target = votes
                .into_iter()
                .max_by_key(|&(id, n)| (n, std::cmp::Reverse(id)))
                .and_then(|(id, _)| gt_map.get(&id));
            let Some(gt) = target else {
                self.false_positives += 1;
                continue;
            };
            seen.insert(gt.target_id);
            match obj.dominant_class {
                ObjectClass::Unknown => self.class_unknown += 1,
                c if c == gt.class => self.class_correct += 1,
                _ => self.class_mismatch += 1,
            }
            let predicted = obj.geometry.extrapolated((gt.time - obj.timestamp).max(0.0));
            self.sum_sq_pos_err += (predicted.center - gt.position).norm_squared();
            self.n_matched += 1;
        }

        self.missed_targets += truth.iter().filter(|g| !seen.contains(&g.target_id)).count() as u64;
    }
}
