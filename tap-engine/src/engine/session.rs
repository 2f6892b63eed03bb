//! Phase list, captured states, durations and snapshots
//!
//! Phases and durations come from outside (editor, session file) and are
//! handed in as a batch. Snapshots go back out through a [`PhaseStore`],
//! with extra sections contributed by registered state providers.

use super::core::TimelineEngine;
use crate::config::LayerSettings;
use crate::error::{Error, Result};
use crate::ports::PhaseStore;
use crate::store::SessionSnapshot;
use crate::timeline::{CapturedState, Phase};
use std::sync::atomic::Ordering;
use tap_common::events::TapEvent;
use tracing::{info, warn};

impl TimelineEngine {
    /// Replace the phase list
    ///
    /// Rejected lists leave the previous one in place.
    pub async fn update_phases(&self, phases: Vec<Phase>) -> Result<()> {
        let phase_count = {
            let mut registry = self.registry.write().await;
            registry.update_phases(phases)?;
            registry.len()
        };
        info!("Phase list updated ({} phases)", phase_count);
        self.events.emit(TapEvent::PhasesUpdated {
            phase_count,
            timestamp: tap_common::time::now(),
        });
        Ok(())
    }

    /// Phases sorted by position
    pub async fn phases(&self) -> Vec<Phase> {
        self.registry.read().await.phases().to_vec()
    }

    pub async fn phase_for_progress(&self, pct: f64) -> Option<Phase> {
        self.registry.read().await.phase_for_progress(pct).cloned()
    }

    /// Phase the layers last converged on
    pub fn current_phase_id(&self) -> Option<String> {
        self.controller.current_phase_id()
    }

    /// Store the committed layer state as `phase_id`'s captured state
    pub async fn capture_phase_state(&self, phase_id: &str) -> Result<CapturedState> {
        let mut captured = CapturedState::default();
        for record in self.layers.snapshot() {
            captured
                .volumes
                .insert(record.id.clone(), record.current_volume);
            if let Some(track) = record.current_track_id {
                captured.active_track.insert(record.id, track);
            }
        }

        self.registry
            .write()
            .await
            .set_captured_state(phase_id, Some(captured.clone()))?;
        info!("Captured layer state into phase {}", phase_id);
        self.events.emit(TapEvent::PhaseCaptured {
            phase_id: phase_id.to_string(),
            cleared: false,
            timestamp: tap_common::time::now(),
        });
        Ok(captured)
    }

    /// Turn `phase_id` back into a label-only phase
    pub async fn clear_captured_state(&self, phase_id: &str) -> Result<()> {
        self.registry
            .write()
            .await
            .set_captured_state(phase_id, None)?;
        self.events.emit(TapEvent::PhaseCaptured {
            phase_id: phase_id.to_string(),
            cleared: true,
            timestamp: tap_common::time::now(),
        });
        Ok(())
    }

    pub fn set_session_duration(&self, duration_ms: u64) -> Result<()> {
        if duration_ms == 0 {
            return Err(Error::Config("Session duration must be > 0".to_string()));
        }
        self.with_clock(|clock| clock.set_total_duration(duration_ms));
        info!(
            "Session duration set to {}",
            tap_common::time::format_session_time(duration_ms)
        );
        Ok(())
    }

    pub fn session_duration_ms(&self) -> u64 {
        self.with_clock(|clock| clock.total_duration_ms())
    }

    /// Duration used by phase transitions started from now on
    pub fn set_transition_duration(&self, duration_ms: u64) {
        self.transition_duration_ms
            .store(duration_ms, Ordering::SeqCst);
    }

    /// Register a callback contributing section `name` to snapshots
    ///
    /// Replaces an earlier provider of the same name.
    pub fn register_state_provider<F>(&self, name: &str, provider: F)
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        let mut providers = self
            .state_providers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if providers.insert(name.to_string(), Box::new(provider)).is_some() {
            warn!("State provider {} replaced", name);
        }
    }

    pub fn unregister_state_provider(&self, name: &str) -> bool {
        self.state_providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Serializable snapshot of the current session
    pub async fn snapshot(&self) -> SessionSnapshot {
        let phases = self.phases().await;
        let layers = self
            .layers
            .snapshot()
            .into_iter()
            .map(|r| LayerSettings {
                id: r.id,
                track: r.current_track_id,
                volume: r.current_volume,
            })
            .collect();
        let extras = self
            .state_providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, provider)| (name.clone(), provider()))
            .collect();

        SessionSnapshot {
            session_duration_ms: self.session_duration_ms(),
            transition_duration_ms: self.transition_duration_ms(),
            phases,
            layers,
            extras,
        }
    }

    pub async fn save_to(&self, store: &dyn PhaseStore) -> Result<()> {
        let snapshot = self.snapshot().await;
        store.save(&snapshot).await
    }

    /// Apply the stored snapshot's durations and phases
    ///
    /// Returns the snapshot so callers can restore their own `extras`
    /// sections; None when the store is empty. Layer state is not restored:
    /// the entry phase's captured state applies when the session starts.
    pub async fn load_from(&self, store: &dyn PhaseStore) -> Result<Option<SessionSnapshot>> {
        let Some(snapshot) = store.load().await? else {
            return Ok(None);
        };

        if snapshot.session_duration_ms == 0 {
            return Err(Error::Store("Snapshot session duration is 0".to_string()));
        }
        self.update_phases(snapshot.phases.clone()).await?;
        self.set_session_duration(snapshot.session_duration_ms)?;
        self.set_transition_duration(snapshot.transition_duration_ms);
        Ok(Some(snapshot))
    }
}
