//! Status accessors and event subscription

use super::core::TimelineEngine;
use crate::state::LayerRecord;
use crate::timeline::ControllerState;
use serde::Serialize;
use tap_common::events::{ClockState, EventBus, TapEvent};
use tokio::sync::broadcast;

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub clock_state: ClockState,
    pub elapsed_ms: u64,
    pub session_duration_ms: u64,
    pub progress_pct: f64,
    pub transition_duration_ms: u64,
    pub controller: ControllerState,
    pub current_phase_id: Option<String>,
    pub phase_count: usize,
    pub layers: Vec<LayerRecord>,
    pub subscribers: usize,
}

impl TimelineEngine {
    /// Collect a status snapshot
    ///
    /// Clock values are those of the last tick.
    pub async fn status(&self) -> EngineStatus {
        let (clock_state, elapsed_ms, session_duration_ms, progress_pct) =
            self.with_clock(|clock| {
                (
                    clock.state(),
                    clock.elapsed_ms(),
                    clock.total_duration_ms(),
                    clock.progress_pct(),
                )
            });

        EngineStatus {
            clock_state,
            elapsed_ms,
            session_duration_ms,
            progress_pct,
            transition_duration_ms: self.transition_duration_ms(),
            controller: self.controller.state(),
            current_phase_id: self.controller.current_phase_id(),
            phase_count: self.registry.read().await.len(),
            layers: self.layers.snapshot(),
            subscribers: self.events.subscriber_count(),
        }
    }

    pub fn controller_state(&self) -> ControllerState {
        self.controller.state()
    }

    /// True when no layer is crossfading or ramping and no transition runs
    pub fn is_settled(&self) -> bool {
        !self.controller.state().is_transitioning() && self.layers.all_settled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TapEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }
}
