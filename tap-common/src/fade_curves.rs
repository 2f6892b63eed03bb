//! Fade curve implementations for gain ramps and crossfades
//!
//! Every gain change the engine makes goes through one of these curves.
//! Positions are normalized (0.0 = start of the ramp, 1.0 = end) and the
//! returned multiplier is applied to the distance between the start and
//! target gain, never to raw samples.

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};

/// Fade curve types for gain ramps
///
/// - Linear: constant rate of change
/// - SCurve: raised cosine, `0.5 - 0.5 × cos(π × t)`; slow start and finish
/// - EqualPower: `sin(t × π/2)`; constant perceived loudness across a crossfade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// v(t) = t
    Linear,

    /// v(t) = 0.5 × (1 - cos(π × t))
    #[default]
    #[serde(alias = "cosine", alias = "s-curve")]
    SCurve,

    /// v(t) = sin(t × π/2)
    EqualPower,
}

impl FadeCurve {
    /// Calculate fade-in multiplier at given position
    ///
    /// # Arguments
    /// * `position` - Normalized position through fade (0.0 to 1.0)
    ///
    /// # Returns
    /// Multiplier rising from 0.0 to 1.0
    pub fn calculate_fade_in(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => t,
            FadeCurve::SCurve => 0.5 - 0.5 * (PI * t).cos(),
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Interpolate between two gains at a normalized position
    ///
    /// `from + (to - from) × fade_in(position)`. Works in both directions,
    /// so a falling ramp uses the same eased shape as a rising one.
    pub fn interpolate(&self, from: f32, to: f32, position: f32) -> f32 {
        from + (to - from) * self.calculate_fade_in(position)
    }

    /// Normalized position of step `index` out of `total` steps
    ///
    /// A zero-step ramp is already complete.
    pub fn step_position(index: u32, total: u32) -> f32 {
        if total == 0 {
            return 1.0;
        }
        (index.min(total) as f32) / (total as f32)
    }

    /// Get human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "Linear",
            FadeCurve::SCurve => "S-Curve",
            FadeCurve::EqualPower => "Equal Power",
        }
    }

    /// Get all available fade curve variants
    pub fn all_variants() -> &'static [FadeCurve] {
        &[FadeCurve::Linear, FadeCurve::SCurve, FadeCurve::EqualPower]
    }
}

impl std::fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
