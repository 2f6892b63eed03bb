//! Per-layer crossfade transactions
//!
//! A crossfade replaces a layer's track: preload the target, swap it in as
//! the active source at gain 0, then move the outgoing source down and the
//! incoming source up over the fade, finally release the outgoing source.
//!
//! Each layer runs at most one transaction. A second request on a busy layer
//! fails fast with `ConcurrentTransitionConflict` instead of queuing.
//!
//! When nothing is producing sound the fade is shortened to a short anti-click
//! switch that goes from Preloading straight to Settling; a silent layer has
//! nothing to crossfade.

use super::preloader::ResourcePreloader;
use super::step_timer::StepTimer;
use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::ports::{LayerOutput, PlaybackActivity};
use crate::state::{CrossfadeState, LayerTable};
use std::sync::Arc;
use tap_common::events::{EventBus, SkipReason, TapEvent};
use tap_common::FadeCurve;
use tracing::{debug, info, warn};

/// How a crossfade request ended without error
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrossfadeOutcome {
    /// The requested track was already active; nothing changed
    AlreadyActive,
    /// Track swapped and committed
    Swapped { immediate: bool },
}

/// Keeps the layer table consistent on every exit path
///
/// Once the new source has been swapped in it is committed even if the
/// transaction is cancelled mid-fade, so the record always names what is
/// actually audible.
struct TransactionGuard<'a> {
    layers: &'a LayerTable,
    output: &'a dyn LayerOutput,
    layer_id: &'a str,
    transaction_id: u64,
    swapped: Option<String>,
    finished: bool,
}

impl TransactionGuard<'_> {
    fn commit(&mut self, volume: f32) -> Result<()> {
        self.finished = true;
        let track = self.swapped.as_deref();
        self.layers.finish_transaction(
            self.layer_id,
            self.transaction_id,
            track.map(|t| (t, volume)),
        )
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(track) = self.swapped.as_deref() else {
            let _ = self
                .layers
                .finish_transaction(self.layer_id, self.transaction_id, None);
            return;
        };

        // A newer transaction may already own the output
        if self.layers.is_latest_transaction(self.layer_id, self.transaction_id) {
            self.output.release_outgoing(self.layer_id);
            let gain = self.output.get_gain(self.layer_id);
            debug!(
                "Crossfade on {} interrupted after swap; keeping {} at {:.3}",
                self.layer_id, track, gain
            );
            let _ = self.layers.finish_transaction(
                self.layer_id,
                self.transaction_id,
                Some((track, gain)),
            );
        }
    }
}

pub struct CrossfadeManager {
    layers: Arc<LayerTable>,
    preloader: Arc<ResourcePreloader>,
    output: Arc<dyn LayerOutput>,
    activity: Arc<dyn PlaybackActivity>,
    events: EventBus,
    curve: FadeCurve,
    step_ms: u64,
    immediate_switch_fade_ms: u64,
}

impl CrossfadeManager {
    pub fn new(
        layers: Arc<LayerTable>,
        preloader: Arc<ResourcePreloader>,
        output: Arc<dyn LayerOutput>,
        activity: Arc<dyn PlaybackActivity>,
        events: EventBus,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            layers,
            preloader,
            output,
            activity,
            events,
            curve: settings.fade_curve,
            step_ms: settings.ramp_step_ms.max(1),
            immediate_switch_fade_ms: settings.immediate_switch_fade_ms,
        }
    }

    /// Crossfade `layer_id` to `track_id` over `duration_ms`
    ///
    /// The incoming source ends at `target_gain`, or at the layer's current
    /// gain when None.
    pub async fn crossfade(
        &self,
        layer_id: &str,
        track_id: &str,
        duration_ms: u64,
        target_gain: Option<f32>,
    ) -> Result<CrossfadeOutcome> {
        let record = self.layers.get(layer_id)?;
        if record.transaction.is_none() && record.current_track_id.as_deref() == Some(track_id) {
            debug!("Layer {} already playing {}", layer_id, track_id);
            return Ok(CrossfadeOutcome::AlreadyActive);
        }

        let transaction = self.layers.begin_transaction(layer_id, track_id, duration_ms)?;
        let token = self.layers.cancel_token(layer_id)?;
        let mut guard = TransactionGuard {
            layers: &self.layers,
            output: self.output.as_ref(),
            layer_id,
            transaction_id: transaction.id,
            swapped: None,
            finished: false,
        };
        let cancelled = || Error::Cancelled(format!("crossfade on {} to {}", layer_id, track_id));

        // Preloading
        let ticket = self.preloader.preload(layer_id, track_id);
        let handle = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(cancelled()),
            result = ticket.wait() => result,
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Crossfade on {} to {} skipped: {}", layer_id, track_id, e);
                self.events.emit(TapEvent::CrossfadeSkipped {
                    layer_id: layer_id.to_string(),
                    track_id: track_id.to_string(),
                    reason: SkipReason::LoadFailed,
                    timestamp: tap_common::time::now(),
                });
                return Err(e);
            }
        };

        // Fading, or straight to Settling for an immediate switch
        let immediate = !self.activity.is_producing_sound();
        let (state, fade_ms) = if immediate {
            (CrossfadeState::Settling, self.immediate_switch_fade_ms)
        } else {
            (CrossfadeState::Fading, duration_ms)
        };
        if !self.layers.set_crossfade_state(layer_id, transaction.id, state)? {
            return Err(cancelled());
        }

        let from_gain = self.output.get_gain(layer_id);
        let to_gain = target_gain.unwrap_or(record.current_volume).clamp(0.0, 1.0);

        info!(
            "Crossfade {}: {:?} -> {} over {}ms{}",
            layer_id,
            transaction.from_track,
            track_id,
            fade_ms,
            if immediate { " (immediate)" } else { "" }
        );
        self.events.emit(TapEvent::CrossfadeStarted {
            layer_id: layer_id.to_string(),
            from_track: transaction.from_track.clone(),
            to_track: track_id.to_string(),
            duration_ms: fade_ms,
            immediate,
            timestamp: tap_common::time::now(),
        });

        self.output.swap_active_source(layer_id, track_id, &handle);
        guard.swapped = Some(track_id.to_string());

        let mut timer = StepTimer::new(fade_ms, self.step_ms);
        while let Some(position) = timer.next_position() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(cancelled()),
                _ = timer.wait() => {}
            }

            let (outgoing, incoming) = if timer.is_last() {
                (0.0, to_gain)
            } else {
                (
                    self.curve.interpolate(from_gain, 0.0, position),
                    self.curve.interpolate(0.0, to_gain, position),
                )
            };
            self.output.set_outgoing_gain(layer_id, outgoing);
            self.output.set_gain(layer_id, incoming);
            self.layers
                .set_transaction_progress(layer_id, transaction.id, position)?;
        }

        // Settling
        if !self
            .layers
            .set_crossfade_state(layer_id, transaction.id, CrossfadeState::Settling)?
        {
            return Err(cancelled());
        }
        self.output.release_outgoing(layer_id);
        guard.commit(to_gain)?;

        self.events.emit(TapEvent::CrossfadeCompleted {
            layer_id: layer_id.to_string(),
            track_id: track_id.to_string(),
            timestamp: tap_common::time::now(),
        });
        Ok(CrossfadeOutcome::Swapped { immediate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerSettings;
    use crate::playback::preloader::ProgressReporter;
    use crate::ports::{ActivityFlag, ResourceHandle, ResourceLoader};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct TwoSlotOutput {
        active: Mutex<HashMap<String, (String, f32)>>,
        outgoing: Mutex<HashMap<String, (String, f32)>>,
        released: Mutex<Vec<String>>,
    }

    impl LayerOutput for TwoSlotOutput {
        fn set_gain(&self, layer_id: &str, value: f32) {
            if let Some(slot) = self.active.lock().unwrap().get_mut(layer_id) {
                slot.1 = value;
            }
        }
        fn get_gain(&self, layer_id: &str) -> f32 {
            self.active.lock().unwrap().get(layer_id).map(|s| s.1).unwrap_or(0.0)
        }
        fn swap_active_source(&self, layer_id: &str, track_id: &str, _: &ResourceHandle) {
            let previous = self
                .active
                .lock()
                .unwrap()
                .insert(layer_id.to_string(), (track_id.to_string(), 0.0));
            if let Some(previous) = previous {
                self.outgoing.lock().unwrap().insert(layer_id.to_string(), previous);
            }
        }
        fn set_outgoing_gain(&self, layer_id: &str, value: f32) {
            if let Some(slot) = self.outgoing.lock().unwrap().get_mut(layer_id) {
                slot.1 = value;
            }
        }
        fn release_outgoing(&self, layer_id: &str) {
            if let Some((track, _)) = self.outgoing.lock().unwrap().remove(layer_id) {
                self.released.lock().unwrap().push(track);
            }
        }
    }

    struct DelayLoader(u64);

    #[async_trait]
    impl ResourceLoader for DelayLoader {
        async fn load(&self, track_id: &str, _: ProgressReporter) -> Result<ResourceHandle> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            if track_id.starts_with("missing") {
                return Err(Error::Store(format!("{} not found", track_id)));
            }
            Ok(ResourceHandle {
                track_id: track_id.to_string(),
                byte_len: 1,
                source: None,
                data: None,
            })
        }
    }

    struct Fixture {
        layers: Arc<LayerTable>,
        output: Arc<TwoSlotOutput>,
        activity: ActivityFlag,
        manager: Arc<CrossfadeManager>,
    }

    fn fixture() -> Fixture {
        let mut drone = LayerSettings::new("drone");
        drone.track = Some("a".to_string());
        drone.volume = 0.6;
        let layers = Arc::new(LayerTable::new(&[drone]));

        let output = Arc::new(TwoSlotOutput::default());
        output
            .active
            .lock()
            .unwrap()
            .insert("drone".to_string(), ("a".to_string(), 0.6));

        let events = EventBus::new(64);
        let preloader = Arc::new(ResourcePreloader::new(Arc::new(DelayLoader(100)), events.clone()));
        let activity = ActivityFlag::new(true);
        let manager = Arc::new(CrossfadeManager::new(
            layers.clone(),
            preloader,
            output.clone(),
            Arc::new(activity.clone()),
            events,
            &EngineSettings::default(),
        ));
        Fixture {
            layers,
            output,
            activity,
            manager,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossfade_commits_new_track() {
        let f = fixture();
        let outcome = f.manager.crossfade("drone", "b", 1000, None).await.unwrap();

        assert_eq!(outcome, CrossfadeOutcome::Swapped { immediate: false });
        let record = f.layers.get("drone").unwrap();
        assert_eq!(record.current_track_id.as_deref(), Some("b"));
        assert_eq!(record.current_volume, 0.6);
        assert_eq!(record.crossfade_state, CrossfadeState::Idle);
        assert_eq!(f.output.get_gain("drone"), 0.6);
        assert_eq!(*f.output.released.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_track_is_noop() {
        let f = fixture();
        let outcome = f.manager.crossfade("drone", "a", 1000, None).await.unwrap();
        assert_eq!(outcome, CrossfadeOutcome::AlreadyActive);
        assert!(f.output.released.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_conflicts() {
        let f = fixture();
        let first = {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.crossfade("drone", "b", 1000, None).await })
        };
        tokio::task::yield_now().await;

        let second = f.manager.crossfade("drone", "c", 1000, None).await;
        assert!(matches!(second, Err(Error::ConcurrentTransitionConflict(_))));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(
            f.layers.get("drone").unwrap().current_track_id.as_deref(),
            Some("b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_playback_switches_immediately() {
        let f = fixture();
        f.activity.set(false);
        let start = tokio::time::Instant::now();

        let outcome = f.manager.crossfade("drone", "b", 4000, None).await.unwrap();
        assert_eq!(outcome, CrossfadeOutcome::Swapped { immediate: true });
        // 100ms load + 30ms anti-click fade
        assert_eq!(start.elapsed(), Duration::from_millis(130));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_leaves_layer_unchanged() {
        let f = fixture();
        let result = f.manager.crossfade("drone", "missing", 1000, None).await;

        assert!(matches!(result, Err(Error::ResourceLoadFailure { .. })));
        let record = f.layers.get("drone").unwrap();
        assert_eq!(record.current_track_id.as_deref(), Some("a"));
        assert_eq!(record.crossfade_state, CrossfadeState::Idle);
        assert_eq!(f.output.get_gain("drone"), 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_preload_changes_nothing() {
        let f = fixture();
        let task = {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.crossfade("drone", "b", 1000, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.layers.cancel_layer("drone").unwrap();

        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled(_))));
        assert_eq!(
            f.layers.get("drone").unwrap().current_track_id.as_deref(),
            Some("a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_fade_commits_swapped_track() {
        let f = fixture();
        let task = {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.crossfade("drone", "b", 1000, None).await })
        };
        // 100ms load, then halfway through the fade
        tokio::time::sleep(Duration::from_millis(600)).await;
        f.layers.cancel_layer("drone").unwrap();

        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled(_))));
        let record = f.layers.get("drone").unwrap();
        assert_eq!(record.current_track_id.as_deref(), Some("b"));
        assert_eq!(record.crossfade_state, CrossfadeState::Idle);
        assert!(record.current_volume > 0.0 && record.current_volume < 0.6);
        assert_eq!(*f.output.released.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_gain_override() {
        let f = fixture();
        f.manager.crossfade("drone", "b", 500, Some(0.2)).await.unwrap();
        assert_eq!(f.output.get_gain("drone"), 0.2);
        assert_eq!(f.layers.get("drone").unwrap().current_volume, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_switch_never_reports_fading() {
        let f = fixture();
        f.activity.set(false);
        let task = {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.crossfade("drone", "b", 4000, None).await })
        };

        // Past the 100ms load, inside the 30ms anti-click fade
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(
            f.layers.crossfade_state("drone").unwrap(),
            CrossfadeState::Settling
        );
        assert!(f.layers.fading_layers().is_empty());

        assert!(task.await.unwrap().is_ok());
        assert_eq!(
            f.layers.crossfade_state("drone").unwrap(),
            CrossfadeState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossfade_from_empty_layer() {
        let layers = Arc::new(LayerTable::new(&[LayerSettings::new("nature")]));
        let output = Arc::new(TwoSlotOutput::default());
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let preloader = Arc::new(ResourcePreloader::new(Arc::new(DelayLoader(10)), events.clone()));
        let manager = CrossfadeManager::new(
            layers.clone(),
            preloader,
            output.clone(),
            Arc::new(ActivityFlag::new(true)),
            events,
            &EngineSettings::default(),
        );

        manager.crossfade("nature", "rain", 200, Some(0.4)).await.unwrap();
        assert_eq!(
            layers.get("nature").unwrap().current_track_id.as_deref(),
            Some("rain")
        );
        assert_eq!(output.get_gain("nature"), 0.4);

        let mut started = None;
        while let Ok(event) = rx.try_recv() {
            if let TapEvent::CrossfadeStarted { from_track, to_track, .. } = event {
                started = Some((from_track, to_track));
            }
        }
        assert_eq!(started, Some((None, "rain".to_string())));
    }
}
