//! Track: one fused object over time.
//!
//! A track keeps, per sensor family, the latest accepted detection of every
//! physical sensor instance (keyed by exact `sensor_id`), a fused belief
//! assignment over object classes, a motion-fusion filter and its life-cycle
//! bookkeeping.
//!
//! # Life cycle
//! - **Birth**: [`Track::new`] from the first detection.
//! - **Hit**: [`Track::update_with_sensor_object`] replaces that sensor's
//!   entry, prunes stale same-family entries, combines class evidence.
//! - **Miss**: [`Track::update_without_sensor_object`] advances the sensor's
//!   invisible clock, prunes stale entries, decays class belief toward
//!   "unknown" and re-evaluates the death predicate.
//! - **Death**: no family has a live entry and every contributing family has
//!   been invisible for longer than its timeout.

use crate::{
    config::{FamilyParams, FusionConfig, MotionConfig, PublishConfig},
    dst::{Bba, BeliefFusionEngine, BeliefLatticeContext},
    error::FusionError,
    motion::MotionFusion,
    types::{ClassProbs, Geometry, ObjectClass, SensorDetection, SensorId, SensorType, TrackId},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Monotonic track-id source. Resettable so tests start from a known base.
#[derive(Debug, Default)]
pub struct TrackIdAllocator {
    next: AtomicU64,
}

impl TrackIdAllocator {
    pub fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    pub fn next_id(&self) -> TrackId {
        TrackId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Id the next track will receive.
    pub fn peek(&self) -> TrackId {
        TrackId(self.next.load(Ordering::Relaxed))
    }

    pub fn reset(&self, base: u64) {
        self.next.store(base, Ordering::Relaxed);
    }
}

/// Read-only collaborators every track needs.
#[derive(Debug)]
pub struct FusionContext {
    pub engine: BeliefFusionEngine,
    pub families: FamilyParams,
    pub publish: PublishConfig,
    pub motion: MotionConfig,
}

impl FusionContext {
    pub fn new(
        lattice: Arc<BeliefLatticeContext>,
        config: &FusionConfig,
    ) -> Result<Self, FusionError> {
        let families = config.validate()?;
        Ok(Self {
            engine: BeliefFusionEngine::new(lattice, config.belief.clone())?,
            families,
            publish: config.publish.clone(),
            motion: config.motion.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Per-sensor entries
// ---------------------------------------------------------------------------

/// Latest detection contributed by one sensor instance.
#[derive(Clone, Debug)]
pub struct SensorObject {
    pub detection: SensorDetection,
    pub association_cost: f64,
}

impl SensorObject {
    pub fn new(detection: SensorDetection, association_cost: f64) -> Self {
        Self {
            detection,
            association_cost,
        }
    }
}

/// Entries of one family keyed by exact sensor id.
pub type SensorObjectMap = BTreeMap<SensorId, SensorObject>;

#[derive(Clone, Debug)]
struct SensorClock {
    family: SensorType,
    /// Timestamp of the last detection from this sensor, if it ever contributed.
    last_seen: Option<f64>,
    last_tick: f64,
    invisible_period: f64,
    last_association_cost: f64,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Publishable snapshot of a track.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusedObject {
    pub track_id: TrackId,
    pub timestamp: f64,
    pub geometry: Geometry,
    /// `(hypothesis, mass)` for the whole lattice.
    pub belief: Vec<(String, f64)>,
    /// Pignistic class probabilities.
    pub class_probs: ClassProbs,
    pub dominant_class: ObjectClass,
    pub contributing_families: Vec<SensorType>,
    /// Upstream ids of the live per-sensor entries.
    pub source_track_hints: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Track {
    id: TrackId,
    ctx: Arc<FusionContext>,
    objects: [SensorObjectMap; SensorType::COUNT],
    /// Per family: true once the family holds no live entry.
    family_invisible: [bool; SensorType::COUNT],
    /// Timestamp of the newest detection seen per family.
    family_last_seen: [Option<f64>; SensorType::COUNT],
    clocks: BTreeMap<SensorId, SensorClock>,
    fused_belief: Bba,
    belief_timestamp: f64,
    fused_timestamp: f64,
    fused_geometry: Geometry,
    motion: MotionFusion,
    born_at: f64,
    /// Newest timestamp seen by any update.
    latest_timestamp: f64,
    corroborated: bool,
    alive: bool,
}

impl Track {
    /// Create a track from its first detection. Fails if the belief lattice
    /// has not been initialized.
    pub fn new(
        detection: SensorDetection,
        ids: &TrackIdAllocator,
        ctx: Arc<FusionContext>,
    ) -> Result<Self, FusionError> {
        let family = detection.sensor_type();
        let params = ctx.families.get(family).clone();
        let fused_belief = ctx
            .engine
            .evidence_from_probs(detection.class_probs(), params.reliability)?;
        let ts = detection.timestamp();
        let motion = MotionFusion::new(detection.geometry(), ts, &params, &ctx.motion);
        let sensor_id = detection.sensor_id().clone();
        let fused_geometry = detection.geometry().clone();

        let mut family_invisible = [true; SensorType::COUNT];
        family_invisible[family.index()] = false;
        let mut family_last_seen = [None; SensorType::COUNT];
        family_last_seen[family.index()] = Some(ts);
        let mut objects: [SensorObjectMap; SensorType::COUNT] = Default::default();
        objects[family.index()].insert(sensor_id.clone(), SensorObject::new(detection, 0.0));
        let clocks = BTreeMap::from([(
            sensor_id,
            SensorClock {
                family,
                last_seen: Some(ts),
                last_tick: ts,
                invisible_period: 0.0,
                last_association_cost: 0.0,
            },
        )]);

        let mut track = Self {
            id: ids.next_id(),
            ctx,
            objects,
            family_invisible,
            family_last_seen,
            clocks,
            fused_belief,
            belief_timestamp: ts,
            fused_timestamp: ts,
            fused_geometry,
            motion,
            born_at: ts,
            latest_timestamp: ts,
            corroborated: params.trusted_primary,
            alive: true,
        };
        track.refresh_corroboration();
        debug!(track = %track.id, %family, t = ts, "track born");
        Ok(track)
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Fold a matched detection into the track.
    pub fn update_with_sensor_object(
        &mut self,
        detection: SensorDetection,
        association_cost: f64,
    ) -> Result<(), FusionError> {
        let ctx = Arc::clone(&self.ctx);
        let family = detection.sensor_type();
        let params = ctx.families.get(family);
        let ts = detection.timestamp();
        let sensor_id = detection.sensor_id().clone();

        // Class evidence: temporal and cross-sensor fusion in one step.
        let evidence = ctx
            .engine
            .evidence_from_probs(detection.class_probs(), params.reliability)?;
        match ctx.engine.combine(&self.fused_belief, &evidence) {
            Ok(posterior) => self.fused_belief = posterior,
            Err(FusionError::FusionConflict { conflict }) => {
                warn!(track = %self.id, sensor = %sensor_id, conflict, "total class conflict, keeping prior belief");
            }
            Err(e) => return Err(e),
        }
        self.belief_timestamp = self.belief_timestamp.max(ts);

        if !self.motion.update(detection.geometry(), ts, params) {
            trace!(track = %self.id, sensor = %sensor_id, t = ts, "motion update skipped");
        }

        let clock = self.clocks.entry(sensor_id.clone()).or_insert(SensorClock {
            family,
            last_seen: None,
            last_tick: ts,
            invisible_period: 0.0,
            last_association_cost: association_cost,
        });
        if clock.last_seen.map_or(true, |seen| ts >= seen) {
            clock.last_seen = Some(ts);
            clock.last_tick = clock.last_tick.max(ts);
            clock.invisible_period = 0.0;
        }
        clock.last_association_cost = association_cost;

        let map = &mut self.objects[family.index()];
        let stale = map
            .get(&sensor_id)
            .is_some_and(|existing| existing.detection.timestamp() > ts);
        if stale {
            trace!(track = %self.id, sensor = %sensor_id, t = ts, "older than stored entry, keeping newer");
        } else {
            map.insert(sensor_id.clone(), SensorObject::new(detection, association_cost));
        }
        Self::update_measurements_life_with_measurement(map, &sensor_id, ts, params.max_life);

        let idx = family.index();
        self.family_invisible[idx] = false;
        self.family_last_seen[idx] = Some(self.family_last_seen[idx].map_or(ts, |t| t.max(ts)));
        self.latest_timestamp = self.latest_timestamp.max(ts);
        if params.trusted_primary {
            self.corroborated = true;
        }
        self.refresh_corroboration();
        if !self.alive {
            debug!(track = %self.id, sensor = %sensor_id, "track revived");
        }
        self.alive = true;
        self.refresh_fused_state();
        Ok(())
    }

    /// Record that `sensor_id` produced no detection for this track at `timestamp`.
    pub fn update_without_sensor_object(
        &mut self,
        sensor_type: SensorType,
        sensor_id: &SensorId,
        association_cost: f64,
        timestamp: f64,
    ) -> Result<(), FusionError> {
        let ctx = Arc::clone(&self.ctx);

        let born_at = self.born_at;
        let clock = self.clocks.entry(sensor_id.clone()).or_insert(SensorClock {
            family: sensor_type,
            last_seen: None,
            last_tick: born_at,
            invisible_period: 0.0,
            last_association_cost: association_cost,
        });
        if timestamp > clock.last_tick {
            clock.invisible_period += timestamp - clock.last_tick;
            clock.last_tick = timestamp;
        }
        clock.last_association_cost = association_cost;

        for family in SensorType::ALL {
            let max_life = ctx.families.get(family).max_life;
            let map = &mut self.objects[family.index()];
            self.family_invisible[family.index()] = if family == sensor_type {
                Self::update_measurements_life_without_measurement(map, sensor_id, timestamp, max_life)
            } else {
                Self::prune_stale(map, timestamp, max_life)
            };
        }

        self.settle(timestamp)
    }

    /// Bring the track up to the cycle time `timestamp` whether or not any
    /// frame of the cycle reached it: entries older than their family's
    /// `max_life` are evicted, the belief decays and death is re-evaluated.
    pub fn advance_to(&mut self, timestamp: f64) -> Result<(), FusionError> {
        if !self.alive {
            return Ok(());
        }
        for family in SensorType::ALL {
            let max_life = self.ctx.families.get(family).max_life;
            self.family_invisible[family.index()] =
                Self::prune_stale(&mut self.objects[family.index()], timestamp, max_life);
        }
        self.settle(timestamp)
    }

    fn settle(&mut self, timestamp: f64) -> Result<(), FusionError> {
        let elapsed = timestamp - self.belief_timestamp;
        self.fused_belief = self.ctx.engine.decay_toward_unknown(&self.fused_belief, elapsed)?;
        self.belief_timestamp = self.belief_timestamp.max(timestamp);
        self.latest_timestamp = self.latest_timestamp.max(timestamp);

        self.refresh_fused_state();
        if self.alive && self.death_predicate() {
            self.alive = false;
            debug!(track = %self.id, t = timestamp, "track died");
        }
        Ok(())
    }

    /// Life-management pass when `sensor_id` has just delivered a detection at
    /// `timestamp`: every other entry older than `max_life` is evicted. The
    /// freshly updated entry always survives.
    pub fn update_measurements_life_with_measurement(
        objects: &mut SensorObjectMap,
        sensor_id: &SensorId,
        timestamp: f64,
        max_life: f64,
    ) {
        objects.retain(|id, obj| {
            id == sensor_id || timestamp - obj.detection.timestamp() <= max_life
        });
    }

    /// Life-management pass when `sensor_id` delivered nothing at `timestamp`:
    /// entries older than `max_life` are evicted. Returns the family's
    /// invisible state: `false` while any entry survives.
    pub fn update_measurements_life_without_measurement(
        objects: &mut SensorObjectMap,
        sensor_id: &SensorId,
        timestamp: f64,
        max_life: f64,
    ) -> bool {
        let invisible = Self::prune_stale(objects, timestamp, max_life);
        if !invisible && !objects.contains_key(sensor_id) {
            trace!(sensor = %sensor_id, t = timestamp, "family still visible through another instance");
        }
        invisible
    }

    fn prune_stale(objects: &mut SensorObjectMap, timestamp: f64, max_life: f64) -> bool {
        objects.retain(|_, obj| timestamp - obj.detection.timestamp() <= max_life);
        objects.is_empty()
    }

    fn death_predicate(&self) -> bool {
        if self.objects.iter().any(|m| !m.is_empty()) {
            return false;
        }
        SensorType::ALL.iter().all(|&family| match self.family_invisible_period(family) {
            Some(period) => period > self.ctx.families.get(family).invisible_timeout,
            None => true,
        })
    }

    /// Time since any instance of `family` last contributed, measured at the
    /// newest timestamp the track has seen. `None` if the family never did.
    pub fn family_invisible_period(&self, family: SensorType) -> Option<f64> {
        self.clocks
            .values()
            .filter(|c| c.family == family)
            .filter_map(|c| c.last_seen)
            .map(|seen| (self.latest_timestamp - seen).max(0.0))
            .reduce(f64::min)
    }

    fn refresh_corroboration(&mut self) {
        if self.corroborated {
            return;
        }
        let newest = self.family_last_seen.iter().flatten().copied().fold(f64::MIN, f64::max);
        let window = self.ctx.publish.corroboration_window;
        let recent = self
            .family_last_seen
            .iter()
            .flatten()
            .filter(|&&t| newest - t <= window)
            .count();
        self.corroborated = recent >= self.ctx.publish.min_corroborating_families.max(1);
    }

    fn refresh_fused_state(&mut self) {
        let mut latest: Option<(&SensorDetection, u8)> = None;
        for family in SensorType::ALL {
            let precedence = self.ctx.families.get(family).precedence;
            for obj in self.objects[family.index()].values() {
                let newer = match latest {
                    None => true,
                    Some((best, best_prec)) => {
                        let (t, bt) = (obj.detection.timestamp(), best.timestamp());
                        t > bt || (t == bt && precedence > best_prec)
                    }
                };
                if newer {
                    latest = Some((&obj.detection, precedence));
                }
            }
        }
        let Some((detection, _)) = latest else {
            return;
        };
        let timestamp = detection.timestamp();
        let mut geometry = detection.geometry().clone();
        let (center, velocity) = self.motion.extrapolate(timestamp);
        geometry.center = center;
        geometry.velocity = velocity;
        self.fused_timestamp = timestamp;
        self.fused_geometry = geometry;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn get_object(&self, family: SensorType, sensor_id: &str) -> Option<&SensorDetection> {
        self.objects[family.index()]
            .get(sensor_id)
            .map(|obj| &obj.detection)
    }

    pub fn get_lidar_object(&self, sensor_id: &str) -> Option<&SensorDetection> {
        self.get_object(SensorType::Lidar, sensor_id)
    }

    pub fn get_radar_object(&self, sensor_id: &str) -> Option<&SensorDetection> {
        self.get_object(SensorType::Radar, sensor_id)
    }

    pub fn get_camera_object(&self, sensor_id: &str) -> Option<&SensorDetection> {
        self.get_object(SensorType::Camera, sensor_id)
    }

    /// Entry of `family` with the largest timestamp.
    pub fn get_latest_object(&self, family: SensorType) -> Option<&SensorDetection> {
        self.objects[family.index()]
            .values()
            .map(|obj| &obj.detection)
            .reduce(|best, d| if d.timestamp() > best.timestamp() { d } else { best })
    }

    pub fn get_latest_lidar_object(&self) -> Option<&SensorDetection> {
        self.get_latest_object(SensorType::Lidar)
    }

    pub fn get_latest_radar_object(&self) -> Option<&SensorDetection> {
        self.get_latest_object(SensorType::Radar)
    }

    pub fn get_latest_camera_object(&self) -> Option<&SensorDetection> {
        self.get_latest_object(SensorType::Camera)
    }

    pub fn sensor_objects(&self, family: SensorType) -> &SensorObjectMap {
        &self.objects[family.index()]
    }

    #[cfg(test)]
    pub(crate) fn sensor_objects_mut(&mut self, family: SensorType) -> &mut SensorObjectMap {
        &mut self.objects[family.index()]
    }

    pub fn get_fused_bba(&self) -> &Bba {
        &self.fused_belief
    }

    pub fn get_fused_timestamp(&self) -> f64 {
        self.fused_timestamp
    }

    pub fn fused_geometry(&self) -> &Geometry {
        &self.fused_geometry
    }

    /// Fused geometry extrapolated to `timestamp` (never backwards).
    pub fn predicted_geometry(&self, timestamp: f64) -> Geometry {
        self.fused_geometry
            .extrapolated((timestamp - self.fused_timestamp).max(0.0))
    }

    /// Seconds since `sensor_id` last contributed, as advanced by misses.
    pub fn invisible_period(&self, sensor_id: &SensorId) -> Option<f64> {
        self.clocks.get(sensor_id).map(|c| c.invisible_period)
    }

    pub fn last_association_cost(&self, sensor_id: &SensorId) -> Option<f64> {
        self.clocks.get(sensor_id).map(|c| c.last_association_cost)
    }

    pub fn is_invisible_in(&self, family: SensorType) -> bool {
        self.family_invisible[family.index()]
    }

    pub fn is_dead(&self) -> bool {
        !self.alive
    }

    pub fn able_to_publish(&self) -> bool {
        self.alive && self.corroborated
    }

    pub fn contributing_families(&self) -> Vec<SensorType> {
        SensorType::ALL
            .into_iter()
            .filter(|f| !self.objects[f.index()].is_empty())
            .collect()
    }

    pub fn dominant_class(&self) -> Result<ObjectClass, FusionError> {
        self.ctx.engine.dominant_class(&self.fused_belief)
    }

    pub fn to_fused_object(&self) -> Result<FusedObject, FusionError> {
        let engine = &self.ctx.engine;
        Ok(FusedObject {
            track_id: self.id,
            timestamp: self.fused_timestamp,
            geometry: self.fused_geometry.clone(),
            belief: engine.describe(&self.fused_belief),
            class_probs: engine.pignistic(&self.fused_belief)?,
            dominant_class: engine.dominant_class(&self.fused_belief)?,
            contributing_families: self.contributing_families(),
            source_track_hints: self
                .objects
                .iter()
                .flat_map(|m| m.values())
                .filter_map(|obj| obj.detection.source_track_hint())
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
