//! Session snapshots and their stores
//!
//! A [`SessionSnapshot`] is everything needed to restore a session: phase
//! list, durations, committed layer state, plus free-form sections
//! contributed by registered state providers.

use crate::config::LayerSettings;
use crate::error::{Error, Result};
use crate::ports::PhaseStore;
use crate::timeline::Phase;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Serializable session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_duration_ms: u64,
    pub transition_duration_ms: u64,
    pub phases: Vec<Phase>,
    /// Committed track and volume per layer
    #[serde(default)]
    pub layers: Vec<LayerSettings>,
    /// Sections contributed by state providers, keyed by provider name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, serde_json::Value>,
}

/// Snapshot persisted as a pretty-printed JSON file
///
/// Saves go to a sibling temp file that is then renamed over the target, so
/// a crash mid-save never leaves a truncated snapshot behind.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PhaseStore for JsonFileStore {
    async fn load(&self) -> Result<Option<SessionSnapshot>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No session file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = serde_json::from_str(&contents).map_err(|e| {
            Error::Store(format!("Invalid session file {}: {}", self.path.display(), e))
        })?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        info!(
            "Saved session ({} phases) to {}",
            snapshot.phases.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Store kept in memory, for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<SessionSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }
}

#[async_trait]
impl PhaseStore for MemoryStore {
    async fn load(&self) -> Result<Option<SessionSnapshot>> {
        Ok(self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }
}
