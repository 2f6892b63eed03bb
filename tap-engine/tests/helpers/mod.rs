//! Test helpers for tap-engine integration tests
//!
//! - RecordingOutput: LayerOutput that records every gain write and source swap
//! - MockLoader: ResourceLoader with configurable delay and failing tracks
//! - Harness: engine wired to both, running on tokio's paused clock

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tap_engine::config::LayerSettings;
use tap_engine::playback::ProgressReporter;
use tap_engine::ports::{ActivityFlag, LayerOutput, ResourceHandle, ResourceLoader, SystemClock};
use tap_engine::timeline::{CapturedState, Phase};
use tap_engine::{EnginePorts, EngineSettings, Error, Result, TimelineEngine};

#[derive(Debug, Clone, Default)]
struct Mix {
    active: Option<(String, f32)>,
    outgoing: Option<(String, f32)>,
}

/// Records every write the engine makes
#[derive(Default)]
pub struct RecordingOutput {
    mixes: Mutex<HashMap<String, Mix>>,
    gain_writes: Mutex<Vec<(String, f32)>>,
    /// Swaps issued while the layer still had an outgoing source
    overlapping_swaps: AtomicUsize,
}

impl RecordingOutput {
    pub fn new(layers: &[LayerSettings]) -> Self {
        let output = Self::default();
        {
            let mut mixes = output.mixes.lock().unwrap();
            for layer in layers {
                mixes.insert(
                    layer.id.clone(),
                    Mix {
                        active: Some((layer.track.clone().unwrap_or_default(), layer.volume)),
                        outgoing: None,
                    },
                );
            }
        }
        output
    }

    pub fn active_track(&self, layer_id: &str) -> Option<String> {
        let mixes = self.mixes.lock().unwrap();
        mixes.get(layer_id)?.active.as_ref().map(|(t, _)| t.clone())
    }

    pub fn has_outgoing(&self, layer_id: &str) -> bool {
        let mixes = self.mixes.lock().unwrap();
        mixes.get(layer_id).map(|m| m.outgoing.is_some()).unwrap_or(false)
    }

    /// Number of gain writes to `layer_id`'s active source so far
    pub fn write_count(&self, layer_id: &str) -> usize {
        self.gain_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == layer_id)
            .count()
    }

    pub fn writes(&self, layer_id: &str) -> Vec<f32> {
        self.gain_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == layer_id)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn overlapping_swaps(&self) -> usize {
        self.overlapping_swaps.load(Ordering::SeqCst)
    }
}

impl LayerOutput for RecordingOutput {
    fn set_gain(&self, layer_id: &str, value: f32) {
        let mut mixes = self.mixes.lock().unwrap();
        let mix = mixes.entry(layer_id.to_string()).or_default();
        let active = mix.active.get_or_insert_with(|| (String::new(), 0.0));
        active.1 = value;
        self.gain_writes
            .lock()
            .unwrap()
            .push((layer_id.to_string(), value));
    }

    fn get_gain(&self, layer_id: &str) -> f32 {
        let mixes = self.mixes.lock().unwrap();
        mixes
            .get(layer_id)
            .and_then(|m| m.active.as_ref())
            .map(|(_, g)| *g)
            .unwrap_or(0.0)
    }

    fn swap_active_source(&self, layer_id: &str, track_id: &str, _handle: &ResourceHandle) {
        let mut mixes = self.mixes.lock().unwrap();
        let mix = mixes.entry(layer_id.to_string()).or_default();
        if mix.outgoing.is_some() {
            self.overlapping_swaps.fetch_add(1, Ordering::SeqCst);
        }
        mix.outgoing = mix.active.take();
        mix.active = Some((track_id.to_string(), 0.0));
    }

    fn set_outgoing_gain(&self, layer_id: &str, value: f32) {
        let mut mixes = self.mixes.lock().unwrap();
        if let Some(outgoing) = mixes.get_mut(layer_id).and_then(|m| m.outgoing.as_mut()) {
            outgoing.1 = value;
        }
    }

    fn release_outgoing(&self, layer_id: &str) {
        let mut mixes = self.mixes.lock().unwrap();
        if let Some(mix) = mixes.get_mut(layer_id) {
            mix.outgoing = None;
        }
    }
}

/// Loader with a fixed delay; tracks named `missing*` or marked failing error
/// out, tracks marked hanging never resolve
pub struct MockLoader {
    delay: Duration,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    loads: AtomicUsize,
}

impl MockLoader {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn fail_track(&self, track_id: &str) {
        self.failing.lock().unwrap().insert(track_id.to_string());
    }

    pub fn hang_track(&self, track_id: &str) {
        self.hanging.lock().unwrap().insert(track_id.to_string());
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceLoader for MockLoader {
    async fn load(&self, track_id: &str, progress: ProgressReporter) -> Result<ResourceHandle> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.hanging.lock().unwrap().contains(track_id) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay / 2).await;
        progress.report(50);
        tokio::time::sleep(self.delay / 2).await;

        if track_id.starts_with("missing") || self.failing.lock().unwrap().contains(track_id) {
            return Err(Error::Store(format!("{} unavailable", track_id)));
        }
        Ok(ResourceHandle {
            track_id: track_id.to_string(),
            byte_len: 4096,
            source: None,
            data: None,
        })
    }
}

pub struct Harness {
    pub engine: Arc<TimelineEngine>,
    pub output: Arc<RecordingOutput>,
    pub loader: Arc<MockLoader>,
    pub activity: ActivityFlag,
}

/// Engine on paused tokio time with the given layers
///
/// Must be called inside a `start_paused` runtime so the SystemClock
/// follows the paused clock.
pub fn harness(settings: EngineSettings) -> Harness {
    let output = Arc::new(RecordingOutput::new(&settings.layers));
    let loader = Arc::new(MockLoader::new(200));
    let activity = ActivityFlag::new(true);

    let ports = EnginePorts {
        output: output.clone(),
        loader: loader.clone(),
        activity: Arc::new(activity.clone()),
        clock: Arc::new(SystemClock::new()),
    };
    let engine = Arc::new(TimelineEngine::new(settings, ports).expect("valid settings"));

    Harness {
        engine,
        output,
        loader,
        activity,
    }
}

pub fn layer(id: &str, track: Option<&str>, volume: f32) -> LayerSettings {
    LayerSettings {
        id: id.to_string(),
        track: track.map(str::to_string),
        volume,
    }
}

pub fn settings(layers: Vec<LayerSettings>, session_ms: u64, transition_ms: u64) -> EngineSettings {
    EngineSettings {
        layers,
        session_duration_ms: session_ms,
        transition_duration_ms: transition_ms,
        ..EngineSettings::default()
    }
}

pub fn state(volumes: &[(&str, f32)], tracks: &[(&str, &str)]) -> CapturedState {
    CapturedState {
        volumes: volumes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        active_track: tracks
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

pub fn entry_phase(volumes: &[(&str, f32)]) -> Phase {
    Phase::entry("p0", "Arrive").with_state(state(volumes, &[]))
}

pub fn assert_gain(output: &RecordingOutput, layer_id: &str, expected: f32) {
    let actual = output.get_gain(layer_id);
    assert!(
        (actual - expected).abs() < 1e-4,
        "layer {} gain {} != expected {}",
        layer_id,
        actual,
        expected
    );
}
