//! Error types for tap-engine
//!
//! Nothing in the engine is fatal to the process. Every variant describes a
//! request that was refused or degraded to "leave the current audible state
//! unchanged", and is reported upward for logging/UI.

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Phase list rejected by update_phases (previous list retained)
    #[error("Invalid phase data: {0}")]
    InvalidPhaseData(String),

    /// Resource loader failed; the layer keeps its current track
    #[error("Resource load failed for {track_id} on layer {layer_id}: {reason}")]
    ResourceLoadFailure {
        layer_id: String,
        track_id: String,
        reason: String,
    },

    /// Layer already has an in-flight crossfade transaction
    #[error("Transition already in progress on layer {0}")]
    ConcurrentTransitionConflict(String),

    /// A phase transition is already converging
    #[error("Phase transition already in progress ({from:?} -> {to})")]
    TransitionInProgress { from: Option<String>, to: String },

    /// Operation cancelled by reset, stop or layer cancel
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Phase transition did not settle within the safety timeout
    #[error("Phase transition to {phase_id} timed out after {timeout_ms}ms")]
    TransitionTimeout { phase_id: String, timeout_ms: u64 },

    /// Layer id not configured
    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    /// Phase id not registered
    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    /// Engine settings rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Phase store load/save failure
    #[error("Store error: {0}")]
    Store(String),

    /// Snapshot (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors bubbled up from tap-common
    #[error(transparent)]
    Common(#[from] tap_common::Error),
}

impl Error {
    /// True for failures that mean "layer busy, try later"
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::ConcurrentTransitionConflict(_) | Error::TransitionInProgress { .. }
        )
    }
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
