//! Fusion configuration: per-family parameters, publish gating, belief decay,
//! motion fusion.
//!
//! Every struct deserializes with `#[serde(default)]` so a JSON file may
//! override any subset of fields. [`FusionConfig::validate`] runs once when a
//! [`crate::track_manager::TrackManager`] is built; nothing is re-checked per
//! detection.

use crate::{error::FusionError, types::SensorType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Per-family parameters
// ---------------------------------------------------------------------------

/// Parameters shared by every physical sensor of one family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorFamilyConfig {
    /// Age (s) after which a per-sensor entry is evicted from a track.
    pub max_life: f64,
    /// Invisible period (s) after which the family no longer keeps a track alive.
    pub invisible_timeout: f64,
    /// Evidence discount in [0, 1]: share of a detection's class mass that is trusted.
    pub reliability: f64,
    /// A single detection from this family is enough to publish a track.
    pub trusted_primary: bool,
    /// Supplies the fused shape when several families are equally fresh (higher wins).
    pub precedence: u8,
    /// Position measurement noise (1σ, meters).
    pub position_noise_std: f64,
    /// Velocity measurement noise (1σ, m/s).
    pub velocity_noise_std: f64,
    /// The detector reports a usable velocity.
    pub measures_velocity: bool,
}

impl Default for SensorFamilyConfig {
    fn default() -> Self {
        Self {
            max_life: 0.5,
            invisible_timeout: 0.5,
            reliability: 0.5,
            trusted_primary: false,
            precedence: 0,
            position_noise_std: 1.0,
            velocity_noise_std: 1.0,
            measures_velocity: false,
        }
    }
}

impl SensorFamilyConfig {
    pub fn lidar() -> Self {
        Self {
            max_life: 0.25,
            invisible_timeout: 0.25,
            reliability: 0.9,
            trusted_primary: true,
            precedence: 2,
            position_noise_std: 0.2,
            velocity_noise_std: 1.0,
            measures_velocity: false,
        }
    }

    pub fn radar() -> Self {
        Self {
            max_life: 0.5,
            invisible_timeout: 0.5,
            reliability: 0.5,
            trusted_primary: false,
            precedence: 1,
            position_noise_std: 1.0,
            velocity_noise_std: 0.3,
            measures_velocity: true,
        }
    }

    pub fn camera() -> Self {
        Self {
            max_life: 0.5,
            invisible_timeout: 0.5,
            reliability: 0.8,
            trusted_primary: false,
            precedence: 0,
            position_noise_std: 2.0,
            velocity_noise_std: 2.0,
            measures_velocity: false,
        }
    }

    fn validate(&self, family: SensorType) -> Result<(), FusionError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(FusionError::ConfigurationError(format!(
                    "{family}: {name} must be finite and > 0, got {v}"
                )))
            }
        };
        positive("max_life", self.max_life)?;
        positive("invisible_timeout", self.invisible_timeout)?;
        positive("position_noise_std", self.position_noise_std)?;
        positive("velocity_noise_std", self.velocity_noise_std)?;
        if !(0.0..=1.0).contains(&self.reliability) {
            return Err(FusionError::ConfigurationError(format!(
                "{family}: reliability must be in [0, 1], got {}",
                self.reliability
            )));
        }
        Ok(())
    }
}

/// Configuration table keyed by family. Every [`SensorType`] must have an entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorFamilyTable(pub BTreeMap<SensorType, SensorFamilyConfig>);

impl Default for SensorFamilyTable {
    fn default() -> Self {
        Self(BTreeMap::from([
            (SensorType::Lidar, SensorFamilyConfig::lidar()),
            (SensorType::Radar, SensorFamilyConfig::radar()),
            (SensorType::Camera, SensorFamilyConfig::camera()),
        ]))
    }
}

impl SensorFamilyTable {
    /// Check every family is present and sane, returning a dense lookup table.
    pub fn validate(&self) -> Result<FamilyParams, FusionError> {
        let mut families = Vec::with_capacity(SensorType::COUNT);
        for family in SensorType::ALL {
            let cfg = self.0.get(&family).ok_or_else(|| {
                FusionError::ConfigurationError(format!(
                    "no max-life/timeout parameters configured for sensor family '{family}'"
                ))
            })?;
            cfg.validate(family)?;
            families.push(cfg.clone());
        }
        Ok(FamilyParams(families))
    }
}

/// Validated per-family parameters indexed by [`SensorType::index`].
#[derive(Clone, Debug)]
pub struct FamilyParams(Vec<SensorFamilyConfig>);

impl FamilyParams {
    pub fn get(&self, family: SensorType) -> &SensorFamilyConfig {
        &self.0[family.index()]
    }
}

// ---------------------------------------------------------------------------
// Publish gating, belief and motion
// ---------------------------------------------------------------------------

/// Corroboration rule for tracks without a trusted-primary detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Distinct families that must have reported within the window.
    pub min_corroborating_families: usize,
    /// Window (s) ending at the fused timestamp.
    pub corroboration_window: f64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            min_corroborating_families: 2,
            corroboration_window: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeliefConfig {
    /// Rate (1/s) at which unconfirmed class mass drains to "unknown".
    pub decay_rate: f64,
}

impl Default for BeliefConfig {
    fn default() -> Self {
        Self { decay_rate: 0.5 }
    }
}

/// Configuration for the constant-velocity motion fusion filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Acceleration noise (1σ, m/s²).
    pub process_noise_std: f64,
    /// Initial velocity uncertainty (1σ, m/s) when the first detection has none.
    pub initial_velocity_std: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            process_noise_std: 2.0,
            initial_velocity_std: 10.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub families: SensorFamilyTable,
    pub publish: PublishConfig,
    pub belief: BeliefConfig,
    pub motion: MotionConfig,
    /// Capacity of the recently-dead history.
    pub dead_history_len: usize,
    /// Seconds a dead track stays revivable by late detections.
    pub dead_grace_period: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            families: SensorFamilyTable::default(),
            publish: PublishConfig::default(),
            belief: BeliefConfig::default(),
            motion: MotionConfig::default(),
            dead_history_len: 64,
            dead_grace_period: 1.0,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<FamilyParams, FusionError> {
        if !self.dead_grace_period.is_finite() || self.dead_grace_period < 0.0 {
            return Err(FusionError::ConfigurationError(format!(
                "dead_grace_period must be finite and >= 0, got {}",
                self.dead_grace_period
            )));
        }
        if !self.publish.corroboration_window.is_finite() || self.publish.corroboration_window < 0.0 {
            return Err(FusionError::ConfigurationError(
                "corroboration_window must be finite and >= 0".into(),
            ));
        }
        if !self.motion.process_noise_std.is_finite() || self.motion.process_noise_std <= 0.0 {
            return Err(FusionError::ConfigurationError(
                "motion process_noise_std must be finite and > 0".into(),
            ));
        }
        self.families.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(FusionConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_family_is_configuration_error() {
        let mut cfg = FusionConfig::default();
        cfg.families.0.remove(&SensorType::Camera);
        match cfg.validate() {
            Err(FusionError::ConfigurationError(msg)) => assert!(msg.contains("camera")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn non_positive_max_life_is_rejected() {
        let mut cfg = FusionConfig::default();
        if let Some(radar) = cfg.families.0.get_mut(&SensorType::Radar) {
            radar.max_life = 0.0;
        }
        assert!(cfg.validate().is_err());
    }
}
