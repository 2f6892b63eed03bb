//! Timeline engine
//!
//! **Module Structure:**
//! - `core.rs`: construction, session clock control, poll/progress loops, reset
//! - `layers.rs`: crossfades, ramps, manual volume, per-layer cancel
//! - `session.rs`: phases, captured states, durations, snapshots
//! - `diagnostics.rs`: status and event subscription

mod core;
mod diagnostics;
mod layers;
mod session;

pub use self::core::{EnginePorts, StateProvider, TimelineEngine};
pub use diagnostics::EngineStatus;
