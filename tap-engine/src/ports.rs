//! Capabilities the engine consumes but does not implement
//!
//! The engine orchestrates; actual gain application, device output, decoding
//! and persistence live behind these traits.
//!
//! - [`Clock`]: wall-clock time source for the session clock
//! - [`LayerOutput`]: per-layer gain and source control
//! - [`PlaybackActivity`]: "is audio currently producing sound"
//! - [`ResourceLoader`]: turns a track id into a ready-to-play handle
//! - [`PhaseStore`]: loads/saves session snapshots

use crate::error::Result;
use crate::playback::preloader::ProgressReporter;
use crate::store::SessionSnapshot;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic wall-clock source in milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock backed by `tokio::time::Instant`
///
/// Follows tokio's paused/auto-advanced time in tests.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually driven clock for deterministic tests and offline rendering
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Ready-to-play audio resource
///
/// Clones share the buffered bytes.
#[derive(Clone, PartialEq)]
pub struct ResourceHandle {
    pub track_id: String,
    /// Size of the buffered resource
    pub byte_len: u64,
    /// Where it was loaded from, if file-backed
    pub source: Option<PathBuf>,
    /// Buffered contents, for loaders that keep the resource in memory
    pub data: Option<Arc<[u8]>>,
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("track_id", &self.track_id)
            .field("byte_len", &self.byte_len)
            .field("source", &self.source)
            .field("buffered", &self.data.is_some())
            .finish()
    }
}

/// Per-layer output control
///
/// Each layer has an *active* source and, during a crossfade, an *outgoing*
/// source. Calls are parameter writes and must not block.
pub trait LayerOutput: Send + Sync {
    /// Set the gain of the layer's active source (0.0-1.0)
    fn set_gain(&self, layer_id: &str, value: f32);

    /// Current gain of the layer's active source
    fn get_gain(&self, layer_id: &str) -> f32;

    /// Make `track_id` the active source, starting at gain 0.0
    ///
    /// The previously active source keeps playing at its current gain as the
    /// outgoing source until [`LayerOutput::release_outgoing`].
    fn swap_active_source(&self, layer_id: &str, track_id: &str, handle: &ResourceHandle);

    /// Set the gain of the outgoing source, if any
    fn set_outgoing_gain(&self, layer_id: &str, value: f32);

    /// Stop and drop the outgoing source
    fn release_outgoing(&self, layer_id: &str);
}

/// Playback activity signal
pub trait PlaybackActivity: Send + Sync {
    fn is_producing_sound(&self) -> bool;
}

/// Activity flag settable by whoever drives audio playback
#[derive(Debug, Clone, Default)]
pub struct ActivityFlag(Arc<AtomicBool>);

impl ActivityFlag {
    pub fn new(active: bool) -> Self {
        Self(Arc::new(AtomicBool::new(active)))
    }

    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }
}

impl PlaybackActivity for ActivityFlag {
    fn is_producing_sound(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resolves a track id into a ready-to-play handle
///
/// Implementations report progress through `progress`; the preloader keeps
/// the reported values monotonic.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, track_id: &str, progress: ProgressReporter) -> Result<ResourceHandle>;
}

/// Session snapshot persistence
#[async_trait]
pub trait PhaseStore: Send + Sync {
    /// Load the stored snapshot, None if nothing has been saved yet
    async fn load(&self) -> Result<Option<SessionSnapshot>>;

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
}
