//! Resource loaders
//!
//! [`FileResourceLoader`] buffers track files from a media root; the bytes
//! travel with the returned handle.
//! [`SimulatedLoader`] stands in when no media is available (dry runs).

use super::preloader::ProgressReporter;
use crate::error::{Error, Result};
use crate::ports::{ResourceHandle, ResourceLoader};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Default read chunk size (256 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Loads tracks as files relative to a media root
///
/// Track ids are relative paths; absolute paths and `..` components are
/// rejected so a session file cannot reach outside the media root.
pub struct FileResourceLoader {
    media_root: PathBuf,
    chunk_size: usize,
}

impl FileResourceLoader {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    /// Map a track id to a file under the media root
    pub fn resolve(&self, track_id: &str) -> Result<PathBuf> {
        let relative = Path::new(track_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if track_id.is_empty() || escapes {
            return Err(Error::Config(format!(
                "Track id {:?} is not a relative path under the media root",
                track_id
            )));
        }
        Ok(self.media_root.join(relative))
    }
}

#[async_trait]
impl ResourceLoader for FileResourceLoader {
    async fn load(&self, track_id: &str, progress: ProgressReporter) -> Result<ResourceHandle> {
        let path = self.resolve(track_id)?;
        let mut file = tokio::fs::File::open(&path).await?;
        let total = file.metadata().await?.len();

        let mut buffer = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
            if total > 0 {
                let pct = (buffer.len() as u64 * 100 / total).min(100) as u8;
                progress.report(pct);
            }
        }

        debug!("Loaded {} ({} bytes) from {}", track_id, buffer.len(), path.display());
        Ok(ResourceHandle {
            track_id: track_id.to_string(),
            byte_len: buffer.len() as u64,
            source: Some(path),
            data: Some(Arc::from(buffer)),
        })
    }
}

/// Loader that succeeds after a fixed delay without touching disk
pub struct SimulatedLoader {
    delay: Duration,
}

impl SimulatedLoader {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ResourceLoader for SimulatedLoader {
    async fn load(&self, track_id: &str, progress: ProgressReporter) -> Result<ResourceHandle> {
        for pct in [25u8, 50, 75] {
            tokio::time::sleep(self.delay / 4).await;
            progress.report(pct);
        }
        tokio::time::sleep(self.delay / 4).await;
        Ok(ResourceHandle {
            track_id: track_id.to_string(),
            byte_len: 0,
            source: None,
            data: None,
        })
    }
}
