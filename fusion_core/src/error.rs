use thiserror::Error;

/// Errors surfaced by the fusion core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    /// Dempster combination of two assignments whose conflict mass is at or
    /// above 1; the posterior is undefined.
    #[error("total conflict between belief assignments (conflict mass {conflict:.6})")]
    FusionConflict { conflict: f64 },
    /// A fusion API was called before the hypothesis lattice was initialized.
    #[error("belief lattice used before initialization")]
    UninitializedFusionState,
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("malformed detection: {0}")]
    MalformedDetection(String),
    #[error("invalid hypothesis lattice: {0}")]
    InvalidLattice(String),
}
