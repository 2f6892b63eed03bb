//! # TAP Common Library
//!
//! Shared code for the therapeutic ambient player:
//! - Error type shared by configuration and utility code
//! - Event types (TapEvent enum) and the broadcast EventBus
//! - Bootstrap configuration loading
//! - Fade curve definitions and calculations
//! - Human-readable session time formatting

pub mod config;
pub mod error;
pub mod events;
pub mod fade_curves;
pub mod time;

pub use error::{Error, Result};
pub use fade_curves::FadeCurve;
