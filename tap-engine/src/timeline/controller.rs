//! Phase transition controller
//!
//! State machine driving layers onto a phase's captured state:
//!
//! ```text
//! AtRest ──► Transitioning(None, entry) ──► PhaseActive(entry)
//! PhaseActive(a) ──► Transitioning(a, b) ──► PhaseActive(b)
//! any ──reset──► AtRest
//! ```
//!
//! Only one transition converges at a time. While `Transitioning`, boundary
//! checks report nothing and explicit triggers fail with
//! `TransitionInProgress`.
//!
//! A transition settles when every crossfade and every volume ramp it
//! started has resolved, or when the safety timeout expires.

use crate::error::{Error, Result};
use crate::playback::{CrossfadeManager, VolumeRampScheduler};
use crate::state::{LayerRecord, LayerTable};
use crate::timeline::phases::{CapturedState, Phase, PhaseRegistry};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tap_common::events::{EventBus, TapEvent};
use tracing::{debug, info, warn};

/// Minimum safety timeout for a transition
pub const MIN_SAFETY_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControllerState {
    /// No phase active
    AtRest,
    PhaseActive {
        phase_id: String,
    },
    Transitioning {
        from: Option<String>,
        to: String,
    },
}

impl ControllerState {
    /// Phase currently active, if any
    pub fn active_phase(&self) -> Option<&str> {
        match self {
            ControllerState::PhaseActive { phase_id } => Some(phase_id),
            _ => None,
        }
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, ControllerState::Transitioning { .. })
    }
}

/// Requested change on one layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerChange {
    pub layer_id: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Crossfade to another track, ending at `gain`
    Track {
        from: Option<String>,
        to: String,
        gain: f32,
    },
    /// Ramp the current track's gain
    Volume { from: f32, to: f32 },
}

/// Diff committed layer state against a captured state
///
/// A layer whose track differs gets a track change that also carries the
/// target volume, so it is never ramped separately. Otherwise a volume change
/// is produced when the difference exceeds `epsilon`.
pub fn diff_layers(records: &[LayerRecord], captured: &CapturedState, epsilon: f32) -> Vec<LayerChange> {
    for layer_id in captured.volumes.keys().chain(captured.active_track.keys()) {
        if !records.iter().any(|r| &r.id == layer_id) {
            warn!("Captured state names unknown layer {}, ignored", layer_id);
        }
    }

    let mut changes = Vec::new();
    for record in records {
        let target_volume = captured.volumes.get(&record.id).copied();
        let target_track = captured.active_track.get(&record.id);

        match target_track {
            Some(track) if record.current_track_id.as_ref() != Some(track) => {
                changes.push(LayerChange {
                    layer_id: record.id.clone(),
                    kind: ChangeKind::Track {
                        from: record.current_track_id.clone(),
                        to: track.clone(),
                        gain: target_volume.unwrap_or(record.current_volume),
                    },
                });
            }
            _ => {
                if let Some(to) = target_volume {
                    if (to - record.current_volume).abs() > epsilon {
                        changes.push(LayerChange {
                            layer_id: record.id.clone(),
                            kind: ChangeKind::Volume {
                                from: record.current_volume,
                                to,
                            },
                        });
                    }
                }
            }
        }
    }
    changes
}

/// Transition admitted by [`PhaseTransitionController::begin`]
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    epoch: u64,
    pub from_phase_id: Option<String>,
    pub target: Phase,
    pub changes: Vec<LayerChange>,
}

/// Outcome of a settled transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReport {
    pub phase_id: String,
    pub from_phase_id: Option<String>,
    pub track_changes: usize,
    pub volume_changes: usize,
    /// Layers whose crossfade or ramp failed; they keep their previous state
    pub failed_layers: Vec<String>,
}

/// Puts the controller back where it was if `run` is dropped before settling
struct AbandonGuard<'a> {
    controller: &'a PhaseTransitionController,
    epoch: u64,
    from_phase_id: Option<String>,
    to_phase_id: String,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || self.controller.epoch.load(Ordering::SeqCst) != self.epoch {
            return;
        }
        let mut state = self.controller.state.lock().unwrap_or_else(|e| e.into_inner());
        let still_ours = matches!(
            &*state,
            ControllerState::Transitioning { to, .. } if *to == self.to_phase_id
        );
        if !still_ours {
            return;
        }
        warn!(
            "Transition to {} abandoned before settling, back to {:?}",
            self.to_phase_id, self.from_phase_id
        );
        *state = match self.from_phase_id.take() {
            Some(phase_id) => ControllerState::PhaseActive { phase_id },
            None => ControllerState::AtRest,
        };
    }
}

pub struct PhaseTransitionController {
    state: Mutex<ControllerState>,
    /// Bumped by reset; a transition from an older epoch never commits
    epoch: AtomicU64,
    layers: Arc<LayerTable>,
    crossfades: Arc<CrossfadeManager>,
    ramps: Arc<VolumeRampScheduler>,
    events: EventBus,
    epsilon: f32,
    safety_factor: f64,
}

impl PhaseTransitionController {
    pub fn new(
        layers: Arc<LayerTable>,
        crossfades: Arc<CrossfadeManager>,
        ramps: Arc<VolumeRampScheduler>,
        events: EventBus,
        epsilon: f32,
        safety_factor: f64,
    ) -> Self {
        Self {
            state: Mutex::new(ControllerState::AtRest),
            epoch: AtomicU64::new(0),
            layers,
            crossfades,
            ramps,
            events,
            epsilon,
            safety_factor,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn current_phase_id(&self) -> Option<String> {
        self.state().active_phase().map(str::to_string)
    }

    /// Phase the poll loop should move to at `progress_pct`, if any
    ///
    /// None while a transition is converging or when the resolved phase is
    /// already active.
    pub fn check_boundary(&self, registry: &PhaseRegistry, progress_pct: f64) -> Option<Phase> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_transitioning() {
            return None;
        }
        let phase = registry.phase_for_progress(progress_pct)?;
        if state.active_phase() == Some(phase.id.as_str()) {
            return None;
        }
        Some(phase.clone())
    }

    /// Enter `Transitioning` toward `target`
    ///
    /// Fails with `TransitionInProgress` while another transition is
    /// converging. The diff is taken against the committed layer state at
    /// this moment.
    pub fn begin(&self, target: &Phase) -> Result<TransitionPlan> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let ControllerState::Transitioning { from, to } = &*state {
            return Err(Error::TransitionInProgress {
                from: from.clone(),
                to: to.clone(),
            });
        }

        let from_phase_id = state.active_phase().map(str::to_string);
        let changes = match &target.captured_state {
            Some(captured) => diff_layers(&self.layers.snapshot(), captured, self.epsilon),
            None => Vec::new(),
        };

        *state = ControllerState::Transitioning {
            from: from_phase_id.clone(),
            to: target.id.clone(),
        };

        Ok(TransitionPlan {
            epoch: self.epoch.load(Ordering::SeqCst),
            from_phase_id,
            target: target.clone(),
            changes,
        })
    }

    /// Drive an admitted transition to completion
    ///
    /// Runs every layer change concurrently and waits for all of them,
    /// bounded by `max(duration × safety factor, 1s)`. On timeout the
    /// outstanding operations are dropped, the phase is still marked active
    /// and `TransitionTimeout` is returned.
    ///
    /// Dropping the future before it resolves abandons the transition: the
    /// in-flight layer work is dropped and the controller returns to the
    /// phase it left, so the next boundary check can try again.
    pub async fn run(&self, plan: TransitionPlan, duration_ms: u64) -> Result<TransitionReport> {
        let phase_id = plan.target.id.clone();
        let mut abandon = AbandonGuard {
            controller: self,
            epoch: plan.epoch,
            from_phase_id: plan.from_phase_id.clone(),
            to_phase_id: phase_id.clone(),
            armed: true,
        };
        let track_changes = plan
            .changes
            .iter()
            .filter(|c| matches!(c.kind, ChangeKind::Track { .. }))
            .count();
        let volume_changes = plan.changes.len() - track_changes;

        info!(
            "Phase transition {:?} -> {} ({} track, {} volume changes)",
            plan.from_phase_id, phase_id, track_changes, volume_changes
        );
        self.events.emit(TapEvent::PhaseTransitionStarted {
            from_phase_id: plan.from_phase_id.clone(),
            to_phase_id: phase_id.clone(),
            track_changes,
            volume_changes,
            timestamp: tap_common::time::now(),
        });

        let operations: Vec<BoxFuture<'_, (String, Result<()>)>> = plan
            .changes
            .iter()
            .map(|change| self.apply(change, duration_ms))
            .collect();

        let timeout_ms = self.safety_timeout_ms(duration_ms);
        let settled =
            tokio::time::timeout(Duration::from_millis(timeout_ms), join_all(operations)).await;
        abandon.armed = false;

        if self.epoch.load(Ordering::SeqCst) != plan.epoch {
            debug!("Transition to {} outlived a reset, discarded", phase_id);
            return Err(Error::Cancelled(format!("transition to {}", phase_id)));
        }

        let results = match settled {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    "Transition to {} did not settle within {}ms; marking active",
                    phase_id, timeout_ms
                );
                self.mark_active(&phase_id);
                self.events.emit(TapEvent::PhaseTransitionTimedOut {
                    phase_id: phase_id.clone(),
                    timeout_ms,
                    timestamp: tap_common::time::now(),
                });
                return Err(Error::TransitionTimeout {
                    phase_id,
                    timeout_ms,
                });
            }
        };

        let failed_layers: Vec<String> = results
            .into_iter()
            .filter_map(|(layer_id, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!("Layer {} did not converge on {}: {}", layer_id, phase_id, e);
                    Some(layer_id)
                }
            })
            .collect();

        self.mark_active(&phase_id);
        self.events.emit(TapEvent::PhaseTransitionSettled {
            phase_id: phase_id.clone(),
            failed_layers: failed_layers.clone(),
            timestamp: tap_common::time::now(),
        });

        Ok(TransitionReport {
            phase_id,
            from_phase_id: plan.from_phase_id,
            track_changes,
            volume_changes,
            failed_layers,
        })
    }

    fn apply<'a>(
        &'a self,
        change: &'a LayerChange,
        duration_ms: u64,
    ) -> BoxFuture<'a, (String, Result<()>)> {
        let layer_id = change.layer_id.clone();
        match &change.kind {
            ChangeKind::Track { to, gain, .. } => async move {
                let result = self
                    .crossfades
                    .crossfade(&change.layer_id, to, duration_ms, Some(*gain))
                    .await
                    .map(|_| ());
                (layer_id, result)
            }
            .boxed(),
            ChangeKind::Volume { from, to } => async move {
                let result = self
                    .ramps
                    .ramp_volume(&change.layer_id, *from, *to, duration_ms)
                    .await
                    .map(|_| ());
                (layer_id, result)
            }
            .boxed(),
        }
    }

    fn mark_active(&self, phase_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = ControllerState::PhaseActive {
            phase_id: phase_id.to_string(),
        };
    }

    /// Safety timeout for a transition of `duration_ms`
    pub fn safety_timeout_ms(&self, duration_ms: u64) -> u64 {
        ((duration_ms as f64 * self.safety_factor).ceil() as u64).max(MIN_SAFETY_TIMEOUT_MS)
    }

    /// Return to `AtRest`, orphaning any converging transition
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = ControllerState::AtRest;
    }
}
