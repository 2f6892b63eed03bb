//! Engine tuning settings
//!
//! Deserialized from the `[engine]` table of the bootstrap TOML file. Every
//! field has a built-in default, so an empty table (or no table) yields a
//! working four-layer engine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tap_common::FadeCurve;
use tracing::warn;

/// Poll interval bounds for phase boundary detection (milliseconds)
pub const MIN_POLL_INTERVAL_MS: u64 = 200;
pub const MAX_POLL_INTERVAL_MS: u64 = 300;

/// One configured audio layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSettings {
    /// Layer identifier (e.g. "drone")
    pub id: String,

    /// Track active when the engine starts
    #[serde(default)]
    pub track: Option<String>,

    /// Gain at engine start (0.0-1.0)
    #[serde(default)]
    pub volume: f32,
}

impl LayerSettings {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            track: None,
            volume: 0.0,
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Fixed layer set
    pub layers: Vec<LayerSettings>,

    /// Total session length; phase positions are percentages of this
    pub session_duration_ms: u64,

    /// Duration of phase-driven crossfades and ramps
    pub transition_duration_ms: u64,

    /// Phase boundary poll interval (clamped to 200-300ms)
    pub poll_interval_ms: u64,

    /// Progress sampling interval for observers
    pub progress_interval_ms: u64,

    /// Gain step size for ramps and crossfades
    pub ramp_step_ms: u64,

    /// Volume differences at or below this are not ramped
    pub volume_epsilon: f32,

    /// Anti-click fade used when swapping tracks while silent
    pub immediate_switch_fade_ms: u64,

    /// Safety timeout for a phase transition, as a multiple of its duration
    pub safety_timeout_factor: f64,

    /// Curve used for all gain interpolation
    pub fade_curve: FadeCurve,

    /// Event bus capacity
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            layers: ["drone", "melody", "rhythm", "nature"]
                .iter()
                .map(|id| LayerSettings::new(id))
                .collect(),
            session_duration_ms: 20 * 60 * 1000,
            transition_duration_ms: 4000,
            poll_interval_ms: 250,
            progress_interval_ms: 100,
            ramp_step_ms: 50,
            volume_epsilon: 0.02,
            immediate_switch_fade_ms: 30,
            safety_timeout_factor: 2.0,
            fade_curve: FadeCurve::SCurve,
            event_capacity: 256,
        }
    }
}

impl EngineSettings {
    /// Build settings from the raw `[engine]` TOML table
    pub fn from_table(table: Option<&toml::Table>) -> Result<Self> {
        let settings = match table {
            Some(table) => toml::Value::Table(table.clone())
                .try_into::<EngineSettings>()
                .map_err(|e| Error::Config(format!("Invalid [engine] table: {}", e)))?,
            None => Self::default(),
        };
        settings.validated()
    }

    /// Validate and normalize
    ///
    /// Out-of-range tuning values are clamped with a warning; structural
    /// problems (no layers, duplicate ids, zero durations) are errors.
    pub fn validated(mut self) -> Result<Self> {
        if self.layers.is_empty() {
            return Err(Error::Config("At least one layer is required".to_string()));
        }

        let mut seen = HashSet::new();
        for layer in &mut self.layers {
            if layer.id.trim().is_empty() {
                return Err(Error::Config("Layer id must not be empty".to_string()));
            }
            if !seen.insert(layer.id.clone()) {
                return Err(Error::Config(format!("Duplicate layer id: {}", layer.id)));
            }
            layer.volume = layer.volume.clamp(0.0, 1.0);
        }

        if self.session_duration_ms == 0 {
            return Err(Error::Config("session_duration_ms must be > 0".to_string()));
        }
        if self.ramp_step_ms == 0 {
            return Err(Error::Config("ramp_step_ms must be > 0".to_string()));
        }
        if self.progress_interval_ms == 0 {
            return Err(Error::Config("progress_interval_ms must be > 0".to_string()));
        }

        let clamped = self
            .poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        if clamped != self.poll_interval_ms {
            warn!(
                "poll_interval_ms {} outside {}-{}ms, using {}",
                self.poll_interval_ms, MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS, clamped
            );
            self.poll_interval_ms = clamped;
        }

        if !(self.safety_timeout_factor >= 1.0) {
            warn!(
                "safety_timeout_factor {} below 1.0, using 2.0",
                self.safety_timeout_factor
            );
            self.safety_timeout_factor = 2.0;
        }

        self.volume_epsilon = self.volume_epsilon.clamp(0.0, 0.5);
        self.event_capacity = self.event_capacity.max(16);

        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.id.clone()).collect()
    }
}
