//! Fundamental types used across the entire workspace.

use crate::error::FusionError;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

// ---------------------------------------------------------------------------
// Scalar type: f64 throughout, timestamps are seconds.
// ---------------------------------------------------------------------------

/// 3-vector used for positions, velocities and box extents (meters, m/s).
pub type Vec3 = Vector3<f64>;

// ---------------------------------------------------------------------------
// Identifier types — newtype wrappers so IDs are never confused at compile time
// ---------------------------------------------------------------------------

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TrackId(pub u64);

/// Name of one physical sensor instance, e.g. `"velodyne_64"` or `"radar_front"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId(pub String);

impl SensorId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Hash, Eq and Ord must agree with the inner `String` for `&str` lookups.
impl Borrow<str> for SensorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SensorId {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Sensor families
// ---------------------------------------------------------------------------

/// Closed set of sensor families. All instances of one family share a
/// configuration entry in [`crate::config::SensorFamilyTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Lidar,
    Radar,
    Camera,
}

impl SensorType {
    pub const COUNT: usize = 3;
    pub const ALL: [SensorType; Self::COUNT] =
        [SensorType::Lidar, SensorType::Radar, SensorType::Camera];

    /// Dense index used for per-family arrays.
    pub fn index(self) -> usize {
        match self {
            SensorType::Lidar => 0,
            SensorType::Radar => 1,
            SensorType::Camera => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorType::Lidar => "lidar",
            SensorType::Radar => "radar",
            SensorType::Camera => "camera",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Object classes
// ---------------------------------------------------------------------------

/// Object class reported by a detector. `Unknown` carries mass the detector
/// could not attribute to any specific class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Pedestrian,
    Bicycle,
    Vehicle,
    Other,
    Unknown,
}

impl ObjectClass {
    pub const COUNT: usize = 5;
    pub const ALL: [ObjectClass; Self::COUNT] = [
        ObjectClass::Pedestrian,
        ObjectClass::Bicycle,
        ObjectClass::Vehicle,
        ObjectClass::Other,
        ObjectClass::Unknown,
    ];

    pub fn index(self) -> usize {
        match self {
            ObjectClass::Pedestrian => 0,
            ObjectClass::Bicycle => 1,
            ObjectClass::Vehicle => 2,
            ObjectClass::Other => 3,
            ObjectClass::Unknown => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectClass::Pedestrian => "pedestrian",
            ObjectClass::Bicycle => "bicycle",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Other => "other",
            ObjectClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-class probability vector produced by a detector, indexed by
/// [`ObjectClass::index`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassProbs(pub [f64; ObjectClass::COUNT]);

impl Default for ClassProbs {
    /// Everything on `Unknown`: a detection that says nothing about its class.
    fn default() -> Self {
        Self::certain(ObjectClass::Unknown)
    }
}

impl ClassProbs {
    /// All probability on one class.
    pub fn certain(class: ObjectClass) -> Self {
        let mut probs = [0.0; ObjectClass::COUNT];
        probs[class.index()] = 1.0;
        Self(probs)
    }

    pub fn get(&self, class: ObjectClass) -> f64 {
        self.0[class.index()]
    }

    pub fn set(&mut self, class: ObjectClass, p: f64) {
        self.0[class.index()] = p;
    }

    /// Most probable class; ties resolve to the earlier class in [`ObjectClass::ALL`].
    pub fn argmax(&self) -> ObjectClass {
        let mut best = ObjectClass::Unknown;
        let mut best_p = f64::NEG_INFINITY;
        for class in ObjectClass::ALL {
            let p = self.get(class);
            if p > best_p {
                best = class;
                best_p = p;
            }
        }
        best
    }

    /// Probabilities must be finite, non-negative and not all zero.
    pub fn validate(&self) -> Result<(), FusionError> {
        if self.0.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(FusionError::MalformedDetection(format!(
                "class probabilities must be finite and non-negative: {:?}",
                self.0
            )));
        }
        if self.0.iter().sum::<f64>() <= 0.0 {
            return Err(FusionError::MalformedDetection(
                "class probabilities sum to zero".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Oriented 3D box with a velocity estimate, in the fusion frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Box centre [x, y, z] (meters)
    pub center: Vec3,
    /// Velocity [vx, vy, vz] (m/s)
    pub velocity: Vec3,
    /// Extent [length, width, height] (meters)
    pub size: Vec3,
    /// Heading around +z (radians)
    pub yaw: f64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            center: Vec3::zeros(),
            velocity: Vec3::zeros(),
            size: Vec3::new(1.0, 1.0, 1.0),
            yaw: 0.0,
        }
    }
}

impl Geometry {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            center: Vec3::new(x, y, 0.0),
            ..Default::default()
        }
    }

    /// Constant-velocity extrapolation by `dt` seconds.
    pub fn extrapolated(&self, dt: f64) -> Self {
        Self {
            center: self.center + self.velocity * dt,
            ..self.clone()
        }
    }

    fn is_finite(&self) -> bool {
        self.center.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.size.iter().all(|v| v.is_finite())
            && self.yaw.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Detections
// ---------------------------------------------------------------------------

/// Object payload of a detection as produced by a per-sensor detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub geometry: Geometry,
    pub class_probs: ClassProbs,
    /// Id assigned by the upstream per-sensor tracker. Informational only.
    #[serde(default)]
    pub source_track_hint: Option<u64>,
}

impl DetectedObject {
    pub fn new(geometry: Geometry, class_probs: ClassProbs) -> Self {
        Self {
            geometry,
            class_probs,
            source_track_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: u64) -> Self {
        self.source_track_hint = Some(hint);
        self
    }
}

/// One sensor's observation of one object at one timestamp. Immutable once
/// built; identity is `(sensor_id, timestamp)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorDetection {
    sensor_type: SensorType,
    sensor_id: SensorId,
    timestamp: f64,
    object: DetectedObject,
}

impl SensorDetection {
    /// Build a detection, rejecting non-finite timestamps or geometry and
    /// unusable class probabilities.
    pub fn new(
        sensor_type: SensorType,
        sensor_id: SensorId,
        timestamp: f64,
        object: DetectedObject,
    ) -> Result<Self, FusionError> {
        if !timestamp.is_finite() {
            return Err(FusionError::MalformedDetection(format!(
                "non-finite timestamp from {sensor_id}"
            )));
        }
        if !object.geometry.is_finite() {
            return Err(FusionError::MalformedDetection(format!(
                "non-finite geometry from {sensor_id} at {timestamp:.3}"
            )));
        }
        object.class_probs.validate()?;
        Ok(Self {
            sensor_type,
            sensor_id,
            timestamp,
            object,
        })
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn geometry(&self) -> &Geometry {
        &self.object.geometry
    }

    pub fn class_probs(&self) -> &ClassProbs {
        &self.object.class_probs
    }

    pub fn source_track_hint(&self) -> Option<u64> {
        self.object.source_track_hint
    }

    pub fn object(&self) -> &DetectedObject {
        &self.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_highest_probability() {
        let mut probs = ClassProbs([0.0; ObjectClass::COUNT]);
        probs.set(ObjectClass::Bicycle, 0.6);
        probs.set(ObjectClass::Vehicle, 0.3);
        probs.set(ObjectClass::Unknown, 0.1);
        assert_eq!(probs.argmax(), ObjectClass::Bicycle);
    }

    #[test]
    fn sensor_id_maps_are_queried_by_name() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(SensorId::new("radar_front"), 1);
        map.insert(SensorId::new("radar_rear"), 2);
        assert_eq!(map.get("radar_rear"), Some(&2));
        assert_eq!(map.get("radar"), None);
    }

    #[test]
    fn detection_rejects_nan_timestamp() {
        let object = DetectedObject::new(Geometry::default(), ClassProbs::default());
        let res = SensorDetection::new(SensorType::Lidar, "velodyne_64".into(), f64::NAN, object);
        assert!(matches!(res, Err(FusionError::MalformedDetection(_))));
    }

    #[test]
    fn detection_rejects_zero_probabilities() {
        let object = DetectedObject::new(Geometry::default(), ClassProbs([0.0; ObjectClass::COUNT]));
        let res = SensorDetection::new(SensorType::Camera, "front".into(), 0.1, object);
        assert!(res.is_err());
    }

    #[test]
    fn extrapolation_moves_center_only() {
        let mut g = Geometry::at(1.0, 2.0);
        g.velocity = Vec3::new(2.0, 0.0, 0.0);
        let moved = g.extrapolated(0.5);
        assert_eq!(moved.center, Vec3::new(2.0, 2.0, 0.0));
        assert_eq!(moved.size, g.size);
    }
}
