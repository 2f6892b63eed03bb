//! Session timeline: clock, phases and the phase transition state machine

pub mod clock;
pub mod controller;
pub mod phases;

pub use clock::SessionClock;
pub use controller::{
    diff_layers, ChangeKind, ControllerState, LayerChange, PhaseTransitionController,
    TransitionPlan, TransitionReport,
};
pub use phases::{CapturedState, Phase, PhaseRegistry};
