//! # Therapeutic Ambient Player engine (tap-engine)
//!
//! Timeline-driven multi-layer crossfade engine.
//!
//! **Purpose:** Advance a session clock, detect phase boundaries, and move a
//! fixed set of audio layers onto each phase's captured volumes and tracks
//! with eased gain ramps and per-layer crossfades.
//!
//! **Architecture:** In-process orchestration over explicit ports
//! ([`ports::LayerOutput`], [`ports::ResourceLoader`], [`ports::Clock`],
//! [`ports::PhaseStore`]). The engine never touches samples; it writes gains
//! and swaps sources.

pub mod config;
pub mod engine;
pub mod error;
pub mod playback;
pub mod ports;
pub mod state;
pub mod store;
pub mod timeline;

pub use config::EngineSettings;
pub use engine::{EnginePorts, EngineStatus, TimelineEngine};
pub use error::{Error, Result};
