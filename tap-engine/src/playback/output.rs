//! In-memory layer output
//!
//! Tracks the active and outgoing source of each layer and their gains, and
//! traces every source change. Used by the binary when no audio backend is
//! attached, and as the reference for what a backend must do.

use crate::ports::{LayerOutput, ResourceHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, trace};

/// One playing source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceState {
    pub track_id: Option<String>,
    pub gain: f32,
}

/// Active and outgoing source of one layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerMix {
    pub active: Option<SourceState>,
    pub outgoing: Option<SourceState>,
}

#[derive(Default)]
pub struct LoggingOutput {
    mixes: Mutex<HashMap<String, LayerMix>>,
}

impl LoggingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a layer with an already-playing track
    pub fn with_source(self, layer_id: &str, track_id: Option<&str>, gain: f32) -> Self {
        self.mixes.lock().unwrap_or_else(|e| e.into_inner()).insert(
            layer_id.to_string(),
            LayerMix {
                active: Some(SourceState {
                    track_id: track_id.map(str::to_string),
                    gain: gain.clamp(0.0, 1.0),
                }),
                outgoing: None,
            },
        );
        self
    }

    pub fn mix(&self, layer_id: &str) -> LayerMix {
        self.mixes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(layer_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl LayerOutput for LoggingOutput {
    fn set_gain(&self, layer_id: &str, value: f32) {
        let mut mixes = self.mixes.lock().unwrap_or_else(|e| e.into_inner());
        let mix = mixes.entry(layer_id.to_string()).or_default();
        let active = mix.active.get_or_insert(SourceState {
            track_id: None,
            gain: 0.0,
        });
        active.gain = value.clamp(0.0, 1.0);
        trace!("{} gain {:.3}", layer_id, active.gain);
    }

    fn get_gain(&self, layer_id: &str) -> f32 {
        self.mixes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(layer_id)
            .and_then(|m| m.active.as_ref())
            .map(|s| s.gain)
            .unwrap_or(0.0)
    }

    fn swap_active_source(&self, layer_id: &str, track_id: &str, handle: &ResourceHandle) {
        let mut mixes = self.mixes.lock().unwrap_or_else(|e| e.into_inner());
        let mix = mixes.entry(layer_id.to_string()).or_default();
        mix.outgoing = mix.active.take();
        mix.active = Some(SourceState {
            track_id: Some(track_id.to_string()),
            gain: 0.0,
        });
        debug!(
            "{}: {} now active ({} bytes), outgoing {:?}",
            layer_id,
            track_id,
            handle.byte_len,
            mix.outgoing.as_ref().and_then(|s| s.track_id.as_deref())
        );
    }

    fn set_outgoing_gain(&self, layer_id: &str, value: f32) {
        let mut mixes = self.mixes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outgoing) = mixes.get_mut(layer_id).and_then(|m| m.outgoing.as_mut()) {
            outgoing.gain = value.clamp(0.0, 1.0);
        }
    }

    fn release_outgoing(&self, layer_id: &str) {
        let mut mixes = self.mixes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(released) = mixes.get_mut(layer_id).and_then(|m| m.outgoing.take()) {
            debug!("{}: released {:?}", layer_id, released.track_id);
        }
    }
}
