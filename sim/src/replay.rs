//! Replay: serialize/deserialize simulation logs for offline analysis.
//!
//! Frames are recorded before association so a log can be replayed against
//! any fusion configuration.

use crate::sensor_sim::RawFrame;
use fusion_core::{metrics::GroundTruth, FusionConfig};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A full recorded simulation log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayLog {
    pub scenario_name: String,
    pub seed: u64,
    pub cycle_dt: f64,
    pub duration: f64,
    /// Configuration the log was recorded with
    pub config: FusionConfig,
    /// All fusion cycles in chronological order
    pub cycles: Vec<ReplayCycle>,
}

/// Everything the sensors produced during one fusion cycle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplayCycle {
    pub timestamp: f64,
    pub frames: Vec<RawFrame>,
    /// Active targets at `timestamp`
    pub ground_truth: Vec<GroundTruth>,
}

impl ReplayLog {
    pub fn total_frames(&self) -> usize {
        self.cycles.iter().map(|c| c.frames.len()).sum()
    }
}

/// Save a replay log to a JSON file.
pub fn save_replay(log: &ReplayLog, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, log)?;
    Ok(())
}

/// Load a replay log from a JSON file.
pub fn load_replay(path: &Path) -> anyhow::Result<ReplayLog> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let log: ReplayLog = serde_json::from_reader(reader)?;
    Ok(log)
}
