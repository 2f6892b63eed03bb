//! Per-layer volume ramps
//!
//! A ramp moves a layer's gain from one value to another in fixed steps,
//! eased with the configured fade curve. The last step always writes the
//! exact target.
//!
//! At most one ramp owns a layer. Starting a new ramp (or a manual volume
//! write) pre-empts the running one at its next step. While the layer is in
//! a crossfade the crossfade owns the gain, so ramp steps skip their writes
//! until it ends.

use super::step_timer::StepTimer;
use crate::error::{Error, Result};
use crate::ports::LayerOutput;
use crate::state::LayerTable;
use std::sync::Arc;
use tap_common::events::{EventBus, TapEvent};
use tap_common::FadeCurve;
use tracing::{debug, warn};

/// How a ramp ended without error
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampOutcome {
    /// Target written
    Completed,
    /// A newer ramp or manual write took over the layer
    Preempted { volume: f32 },
    /// A crossfade owned the gain when the last step was due; `volume` is
    /// the layer's committed volume at that point
    Deferred { volume: f32 },
}

/// Releases the layer's ramp claim on every exit path
struct RampGuard<'a> {
    layers: &'a LayerTable,
    layer_id: &'a str,
    generation: u64,
}

impl Drop for RampGuard<'_> {
    fn drop(&mut self) {
        self.layers.end_ramp(self.layer_id, self.generation);
    }
}

pub struct VolumeRampScheduler {
    layers: Arc<LayerTable>,
    output: Arc<dyn LayerOutput>,
    events: EventBus,
    curve: FadeCurve,
    step_ms: u64,
}

impl VolumeRampScheduler {
    pub fn new(
        layers: Arc<LayerTable>,
        output: Arc<dyn LayerOutput>,
        events: EventBus,
        curve: FadeCurve,
        step_ms: u64,
    ) -> Self {
        Self {
            layers,
            output,
            events,
            curve,
            step_ms: step_ms.max(1),
        }
    }

    /// Ramp `layer_id` from `from` to `to` over `duration_ms`
    ///
    /// A zero duration writes the target immediately. Resolves with
    /// `Err(Cancelled)` within one step of the layer being cancelled.
    pub async fn ramp_volume(
        &self,
        layer_id: &str,
        from: f32,
        to: f32,
        duration_ms: u64,
    ) -> Result<RampOutcome> {
        let from = from.clamp(0.0, 1.0);
        let to = to.clamp(0.0, 1.0);
        let token = self.layers.cancel_token(layer_id)?;
        let generation = self.layers.begin_ramp(layer_id)?;
        let _guard = RampGuard {
            layers: &self.layers,
            layer_id,
            generation,
        };

        let mut timer = StepTimer::new(duration_ms, self.step_ms);
        debug!(
            "Ramp {}: {:.3} -> {:.3} over {}ms ({} steps)",
            layer_id,
            from,
            to,
            duration_ms,
            timer.steps()
        );

        let mut volume = from;
        let mut landed = false;
        while let Some(position) = timer.next_position() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Ramp {} cancelled at {:.3}", layer_id, volume);
                    return Err(Error::Cancelled(format!("volume ramp on {}", layer_id)));
                }
                _ = timer.wait() => {}
            }

            if token.is_cancelled() {
                return Err(Error::Cancelled(format!("volume ramp on {}", layer_id)));
            }
            if !self.layers.ramp_is_current(layer_id, generation) {
                debug!("Ramp {} pre-empted at {:.3}", layer_id, volume);
                self.events.emit(TapEvent::RampInterrupted {
                    layer_id: layer_id.to_string(),
                    volume,
                    timestamp: tap_common::time::now(),
                });
                return Ok(RampOutcome::Preempted { volume });
            }

            volume = if timer.is_last() {
                to
            } else {
                self.curve.interpolate(from, to, position)
            };

            if self.layers.crossfade_state(layer_id)?.owns_gain() {
                continue;
            }
            self.output.set_gain(layer_id, volume);
            self.layers.commit_volume(layer_id, volume)?;
            landed = timer.is_last();
        }

        let (volume, outcome) = if landed {
            (to, RampOutcome::Completed)
        } else {
            let committed = self.layers.get(layer_id)?.current_volume;
            warn!(
                "Ramp {} ended during a crossfade; target {:.3} left to the crossfade, committed {:.3}",
                layer_id, to, committed
            );
            (committed, RampOutcome::Deferred { volume: committed })
        };

        self.events.emit(TapEvent::RampCompleted {
            layer_id: layer_id.to_string(),
            volume,
            timestamp: tap_common::time::now(),
        });
        Ok(outcome)
    }

    /// Manual volume write
    ///
    /// Pre-empts any running ramp on the layer. Refused while the layer is
    /// mid-crossfade.
    pub fn set_layer_volume(&self, layer_id: &str, volume: f32) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        if self.layers.crossfade_state(layer_id)?.owns_gain() {
            return Err(Error::ConcurrentTransitionConflict(layer_id.to_string()));
        }

        self.layers.preempt_ramp(layer_id)?;
        self.output.set_gain(layer_id, volume);
        self.layers.commit_volume(layer_id, volume)?;
        self.events.emit(TapEvent::LayerVolumeChanged {
            layer_id: layer_id.to_string(),
            volume,
            timestamp: tap_common::time::now(),
        });
        Ok(())
    }
}
