//! Engine lifecycle, session clock control and the scheduling loops
//!
//! **Loops:**
//! - poll loop (`poll_interval_ms`, 200-300ms): phase boundary detection
//! - progress loop (`progress_interval_ms`): progress events for observers
//!
//! Both stop on [`TimelineEngine::shutdown`]. Transitions started by the poll
//! loop run on their own task so the loop never waits on a preload.

use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::playback::{CrossfadeManager, ResourcePreloader, VolumeRampScheduler};
use crate::ports::{Clock, LayerOutput, PlaybackActivity, ResourceLoader};
use crate::state::LayerTable;
use crate::timeline::{
    PhaseRegistry, PhaseTransitionController, SessionClock, TransitionPlan, TransitionReport,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tap_common::events::{ClockState, EventBus, TapEvent};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Produces one named section of a session snapshot
pub type StateProvider = Box<dyn Fn() -> serde_json::Value + Send + Sync>;

/// External capabilities the engine is built on
#[derive(Clone)]
pub struct EnginePorts {
    pub output: Arc<dyn LayerOutput>,
    pub loader: Arc<dyn ResourceLoader>,
    pub activity: Arc<dyn PlaybackActivity>,
    pub clock: Arc<dyn Clock>,
}

/// Timeline-driven multi-layer crossfade engine
///
/// One owned instance per session. Observers follow it through
/// [`TimelineEngine::subscribe`].
pub struct TimelineEngine {
    pub(super) settings: EngineSettings,
    pub(super) events: EventBus,
    pub(super) clock: Mutex<SessionClock>,
    pub(super) registry: RwLock<PhaseRegistry>,
    pub(super) layers: Arc<LayerTable>,
    pub(super) preloader: Arc<ResourcePreloader>,
    pub(super) crossfades: Arc<CrossfadeManager>,
    pub(super) ramps: Arc<VolumeRampScheduler>,
    pub(super) controller: Arc<PhaseTransitionController>,
    pub(super) transition_duration_ms: AtomicU64,
    pub(super) state_providers: Mutex<BTreeMap<String, StateProvider>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Transition tasks not yet awaited; a reset can leave a stale one
    /// winding down next to the current one
    transition_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TimelineEngine {
    pub fn new(settings: EngineSettings, ports: EnginePorts) -> Result<Self> {
        let settings = settings.validated()?;
        let events = EventBus::new(settings.event_capacity);
        let layers = Arc::new(LayerTable::new(&settings.layers));

        let preloader = Arc::new(ResourcePreloader::new(ports.loader, events.clone()));
        let crossfades = Arc::new(CrossfadeManager::new(
            Arc::clone(&layers),
            Arc::clone(&preloader),
            Arc::clone(&ports.output),
            ports.activity,
            events.clone(),
            &settings,
        ));
        let ramps = Arc::new(VolumeRampScheduler::new(
            Arc::clone(&layers),
            ports.output,
            events.clone(),
            settings.fade_curve,
            settings.ramp_step_ms,
        ));
        let controller = Arc::new(PhaseTransitionController::new(
            Arc::clone(&layers),
            Arc::clone(&crossfades),
            Arc::clone(&ramps),
            events.clone(),
            settings.volume_epsilon,
            settings.safety_timeout_factor,
        ));

        info!(
            "Timeline engine ready: layers {:?}, session {}, transitions {}ms ({})",
            settings.layer_ids(),
            tap_common::time::format_session_time(settings.session_duration_ms),
            settings.transition_duration_ms,
            settings.fade_curve
        );

        Ok(Self {
            clock: Mutex::new(SessionClock::new(ports.clock, settings.session_duration_ms)),
            registry: RwLock::new(PhaseRegistry::new()),
            transition_duration_ms: AtomicU64::new(settings.transition_duration_ms),
            state_providers: Mutex::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            transition_tasks: Mutex::new(Vec::new()),
            settings,
            events,
            layers,
            preloader,
            crossfades,
            ramps,
            controller,
        })
    }

    pub(super) fn with_clock<T>(&self, f: impl FnOnce(&mut SessionClock) -> T) -> T {
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut clock)
    }

    fn clock_transition(&self, f: impl FnOnce(&mut SessionClock) -> bool) -> bool {
        let (changed, old_state, new_state, elapsed_ms) = self.with_clock(|clock| {
            let old_state = clock.state();
            let changed = f(clock);
            (changed, old_state, clock.state(), clock.elapsed_ms())
        });
        if changed && old_state != new_state {
            info!("Session clock {} -> {} at {}ms", old_state, new_state, elapsed_ms);
            self.events.emit(TapEvent::ClockStateChanged {
                old_state,
                new_state,
                elapsed_ms,
                timestamp: tap_common::time::now(),
            });
        }
        changed
    }

    // ========================================================================
    // Session clock
    // ========================================================================

    /// Start the session clock
    ///
    /// Audio playback must already be running; the clock only keeps time.
    /// No-op while running unless `reset`, which also cancels in-flight layer
    /// work and re-applies the entry phase.
    pub fn start(&self, reset: bool) -> bool {
        if reset {
            self.cancel_in_flight();
        }
        self.clock_transition(|clock| clock.start(reset))
    }

    pub fn pause(&self) -> bool {
        self.clock_transition(SessionClock::pause)
    }

    pub fn resume(&self) -> bool {
        self.clock_transition(SessionClock::resume)
    }

    /// Stop the clock and cancel all in-flight ramps and crossfades
    pub fn stop(&self, keep_position: bool) -> bool {
        self.cancel_in_flight();
        self.clock_transition(|clock| clock.stop(keep_position))
    }

    pub fn seek_to_time(&self, ms: i64) -> u64 {
        let elapsed_ms = self.with_clock(|clock| clock.seek_to_time(ms));
        self.emit_seek(elapsed_ms);
        elapsed_ms
    }

    pub fn seek_to_percent(&self, pct: f64) -> u64 {
        let elapsed_ms = self.with_clock(|clock| clock.seek_to_percent(pct));
        self.emit_seek(elapsed_ms);
        elapsed_ms
    }

    fn emit_seek(&self, elapsed_ms: u64) {
        debug!("Seeked to {}ms", elapsed_ms);
        self.events.emit(TapEvent::ClockSeeked {
            elapsed_ms,
            timestamp: tap_common::time::now(),
        });
    }

    /// Sample the wall clock; all reads until the next tick see this value
    pub fn tick(&self) -> u64 {
        self.with_clock(SessionClock::tick)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.with_clock(|clock| clock.elapsed_ms())
    }

    pub fn progress_pct(&self) -> f64 {
        self.with_clock(|clock| clock.progress_pct())
    }

    pub fn clock_state(&self) -> ClockState {
        self.with_clock(|clock| clock.state())
    }

    // ========================================================================
    // Phase boundary detection
    // ========================================================================

    /// One poll-loop iteration
    ///
    /// Ticks the clock and, if progress resolves to a phase other than the
    /// active one, starts converging on it in the background. Returns true
    /// when a transition was started.
    pub async fn poll_once(&self) -> bool {
        let progress = self.with_clock(|clock| {
            if !clock.is_running() {
                return None;
            }
            clock.tick();
            Some(clock.progress_pct())
        });
        let Some(progress) = progress else {
            return false;
        };

        let target = {
            let registry = self.registry.read().await;
            self.controller.check_boundary(&registry, progress)
        };
        let Some(target) = target else {
            return false;
        };

        match self.controller.begin(&target) {
            Ok(plan) => {
                debug!("Boundary crossed at {:.2}%: {}", progress, target.id);
                self.spawn_transition(plan);
                true
            }
            Err(e) => {
                debug!("Boundary at {:.2}% deferred: {}", progress, e);
                false
            }
        }
    }

    fn spawn_transition(&self, plan: TransitionPlan) {
        let controller = Arc::clone(&self.controller);
        let duration_ms = self.transition_duration_ms();
        let handle = tokio::spawn(async move {
            match controller.run(plan, duration_ms).await {
                Ok(report) if report.failed_layers.is_empty() => {
                    debug!("Phase {} settled", report.phase_id);
                }
                Ok(report) => warn!(
                    "Phase {} settled with failed layers {:?}",
                    report.phase_id, report.failed_layers
                ),
                Err(Error::Cancelled(what)) => debug!("{} cancelled", what),
                Err(e) => warn!("{}", e),
            }
        });
        let mut tasks = self.transition_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Converge on `phase_id` now, bypassing the progress poll
    ///
    /// Resolves once the transition settles.
    pub async fn trigger_phase(&self, phase_id: &str) -> Result<TransitionReport> {
        let target = self
            .registry
            .read()
            .await
            .get(phase_id)
            .cloned()
            .ok_or_else(|| Error::UnknownPhase(phase_id.to_string()))?;

        let plan = self.controller.begin(&target)?;
        info!("Phase {} triggered manually", phase_id);
        self.controller.run(plan, self.transition_duration_ms()).await
    }

    /// Wait for every transition started by the poll loop
    ///
    /// Includes transitions orphaned by a reset that are still unwinding.
    pub async fn wait_for_transition(&self) {
        let handles: Vec<_> = self
            .transition_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ========================================================================
    // Loops and teardown
    // ========================================================================

    /// Spawn the poll and progress loops
    pub fn spawn_loops(self: &Arc<Self>) {
        let poll = {
            let engine = Arc::clone(self);
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.settings.poll_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            engine.poll_once().await;
                        }
                    }
                }
                debug!("Poll loop stopped");
            })
        };

        let progress = {
            let engine = Arc::clone(self);
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.settings.progress_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => engine.emit_progress(),
                    }
                }
                debug!("Progress loop stopped");
            })
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(poll);
        tasks.push(progress);
    }

    fn emit_progress(&self) {
        let sample = self.with_clock(|clock| {
            if !clock.is_running() {
                return None;
            }
            clock.tick();
            Some((clock.elapsed_ms(), clock.total_duration_ms(), clock.progress_pct()))
        });
        if let Some((elapsed_ms, duration_ms, percent)) = sample {
            self.events.emit(TapEvent::Progress {
                elapsed_ms,
                duration_ms,
                percent,
                timestamp: tap_common::time::now(),
            });
        }
    }

    /// Clear the timeline: cancel all layer work, stop the clock at 0
    pub fn reset_timeline(&self) {
        self.cancel_in_flight();
        self.clock_transition(|clock| clock.stop(false));
        info!("Timeline reset");
        self.events.emit(TapEvent::TimelineReset {
            timestamp: tap_common::time::now(),
        });
    }

    /// Cancel ramps and crossfades and return the controller to rest
    ///
    /// Layers are Idle on return; the cancelled operations resolve as
    /// failures on their own tasks.
    fn cancel_in_flight(&self) {
        self.controller.reset();
        self.layers.cancel_all();
    }

    /// Stop the loops and cancel in-flight work
    pub async fn shutdown(&self) {
        info!("Shutting down timeline engine");
        self.shutdown.cancel();
        self.cancel_in_flight();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.wait_for_transition().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn transition_duration_ms(&self) -> u64 {
        self.transition_duration_ms.load(Ordering::SeqCst)
    }
}
