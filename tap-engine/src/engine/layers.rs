//! Per-layer operations: crossfades, ramps, manual volume, cancellation

use super::core::TimelineEngine;
use crate::error::Result;
use crate::playback::{CrossfadeOutcome, PreloadTicket, RampOutcome};
use crate::state::LayerRecord;
use tracing::info;

impl TimelineEngine {
    /// Crossfade a layer to another track, keeping its current gain
    ///
    /// `duration_ms` defaults to the transition duration.
    pub async fn crossfade(
        &self,
        layer_id: &str,
        track_id: &str,
        duration_ms: Option<u64>,
    ) -> Result<CrossfadeOutcome> {
        let duration_ms = duration_ms.unwrap_or_else(|| self.transition_duration_ms());
        self.crossfades
            .crossfade(layer_id, track_id, duration_ms, None)
            .await
    }

    /// Crossfade a layer to another track, ending at `gain`
    pub async fn crossfade_to_gain(
        &self,
        layer_id: &str,
        track_id: &str,
        duration_ms: Option<u64>,
        gain: f32,
    ) -> Result<CrossfadeOutcome> {
        let duration_ms = duration_ms.unwrap_or_else(|| self.transition_duration_ms());
        self.crossfades
            .crossfade(layer_id, track_id, duration_ms, Some(gain))
            .await
    }

    pub async fn ramp_volume(
        &self,
        layer_id: &str,
        from: f32,
        to: f32,
        duration_ms: u64,
    ) -> Result<RampOutcome> {
        self.ramps.ramp_volume(layer_id, from, to, duration_ms).await
    }

    /// Manual volume change; wins over any running phase ramp
    pub fn set_layer_volume(&self, layer_id: &str, volume: f32) -> Result<()> {
        self.ramps.set_layer_volume(layer_id, volume)
    }

    /// Cancel one layer's crossfade and ramp
    pub fn cancel_layer(&self, layer_id: &str) -> Result<()> {
        info!("Cancelling layer {}", layer_id);
        self.layers.cancel_layer(layer_id)
    }

    /// Warm a track ahead of a crossfade
    pub fn preload(&self, layer_id: &str, track_id: &str) -> Result<PreloadTicket> {
        // Validates the layer id
        self.layers.get(layer_id)?;
        Ok(self.preloader.preload(layer_id, track_id))
    }

    pub fn layers(&self) -> Vec<LayerRecord> {
        self.layers.snapshot()
    }

    pub fn layer(&self, layer_id: &str) -> Result<LayerRecord> {
        self.layers.get(layer_id)
    }
}
