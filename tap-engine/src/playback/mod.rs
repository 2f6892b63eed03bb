//! Layer playback control
//!
//! Gain-level machinery for the layers: preloading, crossfade transactions
//! and volume ramps. Everything here writes through
//! [`crate::ports::LayerOutput`]; nothing touches audio samples.

pub mod crossfade;
pub mod loader;
pub mod output;
pub mod preloader;
pub mod ramp;
mod step_timer;

pub use crossfade::{CrossfadeManager, CrossfadeOutcome};
pub use loader::{FileResourceLoader, SimulatedLoader};
pub use output::LoggingOutput;
pub use preloader::{PreloadStatus, PreloadTicket, ProgressReporter, ResourcePreloader};
pub use ramp::{RampOutcome, VolumeRampScheduler};
