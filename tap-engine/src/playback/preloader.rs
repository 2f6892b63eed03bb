//! Resource preloader
//!
//! Makes sure a track's resource is ready before a crossfade needs it.
//! Requests are keyed by (layer, track): concurrent requests for the same key
//! share one underlying load and observe the same completion, and requests
//! for an already-loaded key complete immediately.
//!
//! Loads always run on their own task, so awaiting a [`PreloadTicket`] never
//! blocks the caller's loop.

use crate::error::{Error, Result};
use crate::ports::{ResourceHandle, ResourceLoader};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tap_common::events::{EventBus, TapEvent};
use tokio::sync::watch;
use tracing::{debug, warn};

type PreloadKey = (String, String);

/// Observable state of one load
#[derive(Debug, Clone, PartialEq)]
pub enum PreloadStatus {
    /// In progress, percent 0-100
    Loading { percent: u8 },
    Ready(ResourceHandle),
    Failed(String),
}

impl PreloadStatus {
    pub fn percent(&self) -> u8 {
        match self {
            PreloadStatus::Loading { percent } => *percent,
            PreloadStatus::Ready(_) => 100,
            PreloadStatus::Failed(_) => 0,
        }
    }
}

enum PreloadEntry {
    Ready(ResourceHandle),
    Loading(watch::Receiver<PreloadStatus>),
}

/// Progress sink handed to a [`ResourceLoader`]
///
/// Drops regressions and clamps to 100, so observers always see a
/// monotonically increasing percentage.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<PreloadStatus>>,
    layer_id: String,
    track_id: String,
    events: Option<EventBus>,
}

impl ProgressReporter {
    fn new(
        tx: Arc<watch::Sender<PreloadStatus>>,
        layer_id: &str,
        track_id: &str,
        events: Option<EventBus>,
    ) -> Self {
        Self {
            tx,
            layer_id: layer_id.to_string(),
            track_id: track_id.to_string(),
            events,
        }
    }

    /// Reporter that goes nowhere, for calling a loader directly
    pub fn detached(track_id: &str) -> Self {
        let (tx, _rx) = watch::channel(PreloadStatus::Loading { percent: 0 });
        Self::new(Arc::new(tx), "", track_id, None)
    }

    /// Report progress in percent
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let advanced = self.tx.send_if_modified(|status| match status {
            PreloadStatus::Loading { percent: current } if percent > *current => {
                *current = percent;
                true
            }
            _ => false,
        });

        if advanced {
            if let Some(events) = &self.events {
                events.emit(TapEvent::PreloadProgress {
                    layer_id: self.layer_id.clone(),
                    track_id: self.track_id.clone(),
                    percent,
                    timestamp: tap_common::time::now(),
                });
            }
        }
    }

    /// Last reported percent
    pub fn percent(&self) -> u8 {
        self.tx.borrow().percent()
    }
}

/// Handle on a (possibly shared) load
pub struct PreloadTicket {
    rx: watch::Receiver<PreloadStatus>,
    layer_id: String,
    track_id: String,
}

impl PreloadTicket {
    /// Current progress, 0-100
    pub fn progress(&self) -> u8 {
        self.rx.borrow().percent()
    }

    /// Progress stream; every change of status is observable
    pub fn subscribe(&self) -> watch::Receiver<PreloadStatus> {
        self.rx.clone()
    }

    /// Wait for the load to finish
    pub async fn wait(mut self) -> Result<ResourceHandle> {
        loop {
            match &*self.rx.borrow_and_update() {
                PreloadStatus::Ready(handle) => return Ok(handle.clone()),
                PreloadStatus::Failed(reason) => {
                    return Err(Error::ResourceLoadFailure {
                        layer_id: self.layer_id.clone(),
                        track_id: self.track_id.clone(),
                        reason: reason.clone(),
                    })
                }
                PreloadStatus::Loading { .. } => {}
            }

            if self.rx.changed().await.is_err() {
                // Sender dropped: the final value is still readable
                return match &*self.rx.borrow() {
                    PreloadStatus::Ready(handle) => Ok(handle.clone()),
                    _ => Err(Error::ResourceLoadFailure {
                        layer_id: self.layer_id.clone(),
                        track_id: self.track_id.clone(),
                        reason: "load task ended without a result".to_string(),
                    }),
                };
            }
        }
    }
}

/// Idempotent, shared-load preloader
pub struct ResourcePreloader {
    loader: Arc<dyn ResourceLoader>,
    entries: Arc<Mutex<HashMap<PreloadKey, PreloadEntry>>>,
    events: EventBus,
}

impl ResourcePreloader {
    pub fn new(loader: Arc<dyn ResourceLoader>, events: EventBus) -> Self {
        Self {
            loader,
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Start (or join) the load of `track_id` for `layer_id`
    pub fn preload(&self, layer_id: &str, track_id: &str) -> PreloadTicket {
        let key = (layer_id.to_string(), track_id.to_string());
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let rx = match entries.get(&key) {
            Some(PreloadEntry::Ready(handle)) => {
                debug!("Preload {}/{}: already loaded", layer_id, track_id);
                let (_tx, rx) = watch::channel(PreloadStatus::Ready(handle.clone()));
                rx
            }
            Some(PreloadEntry::Loading(rx)) => {
                debug!("Preload {}/{}: joining in-flight load", layer_id, track_id);
                rx.clone()
            }
            None => {
                let (tx, rx) = watch::channel(PreloadStatus::Loading { percent: 0 });
                entries.insert(key.clone(), PreloadEntry::Loading(rx.clone()));
                self.spawn_load(key, Arc::new(tx));
                rx
            }
        };

        PreloadTicket {
            rx,
            layer_id: layer_id.to_string(),
            track_id: track_id.to_string(),
        }
    }

    fn spawn_load(&self, key: PreloadKey, tx: Arc<watch::Sender<PreloadStatus>>) {
        let loader = Arc::clone(&self.loader);
        let entries = Arc::clone(&self.entries);
        let reporter = ProgressReporter::new(
            Arc::clone(&tx),
            &key.0,
            &key.1,
            Some(self.events.clone()),
        );

        tokio::spawn(async move {
            let (layer_id, track_id) = (&key.0, &key.1);
            debug!("Loading {} for layer {}", track_id, layer_id);
            let result = loader.load(track_id, reporter.clone()).await;

            let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(handle) => {
                    reporter.report(100);
                    entries.insert(key.clone(), PreloadEntry::Ready(handle.clone()));
                    tx.send_replace(PreloadStatus::Ready(handle));
                }
                Err(e) => {
                    warn!("Preload of {} for layer {} failed: {}", track_id, layer_id, e);
                    // Forget the failure so a later request retries
                    entries.remove(&key);
                    tx.send_replace(PreloadStatus::Failed(e.to_string()));
                }
            }
        });
    }

    /// True once (layer, track) is loaded
    pub fn is_loaded(&self, layer_id: &str, track_id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        matches!(
            entries.get(&(layer_id.to_string(), track_id.to_string())),
            Some(PreloadEntry::Ready(_))
        )
    }

    /// Drop a loaded resource; in-flight loads are left alone
    pub fn evict(&self, layer_id: &str, track_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = (layer_id.to_string(), track_id.to_string());
        if matches!(entries.get(&key), Some(PreloadEntry::Ready(_))) {
            entries.remove(&key);
            return true;
        }
        false
    }
}
