//! Event types for the TAP event system
//!
//! The engine never dispatches ambient/global events. Every notification is
//! a [`TapEvent`] sent through an explicit [`EventBus`] that observers
//! subscribe to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Session clock run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockState {
    /// Not started, or stopped
    Stopped,
    /// Advancing
    Running,
    /// Frozen at the current position
    Paused,
}

impl std::fmt::Display for ClockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockState::Stopped => write!(f, "Stopped"),
            ClockState::Running => write!(f, "Running"),
            ClockState::Paused => write!(f, "Paused"),
        }
    }
}

/// Why a crossfade did not swap the layer's track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Resource loader failed; current track stays active
    LoadFailed,
    /// Cancelled by reset, stop or an explicit layer cancel
    Cancelled,
}

/// TAP event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TapEvent {
    /// Session clock changed run state
    ClockStateChanged {
        old_state: ClockState,
        new_state: ClockState,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Session clock was seeked
    ClockSeeked {
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Progress sample (emitted by the progress sampling loop)
    Progress {
        elapsed_ms: u64,
        duration_ms: u64,
        percent: f64,
        timestamp: DateTime<Utc>,
    },

    /// Preload progress for a layer/track pair (0-100, monotonic)
    PreloadProgress {
        layer_id: String,
        track_id: String,
        percent: u8,
        timestamp: DateTime<Utc>,
    },

    /// Crossfade transaction started fading (or immediate switch started)
    CrossfadeStarted {
        layer_id: String,
        from_track: Option<String>,
        to_track: String,
        duration_ms: u64,
        immediate: bool,
        timestamp: DateTime<Utc>,
    },

    /// Crossfade transaction committed the new track
    CrossfadeCompleted {
        layer_id: String,
        track_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Crossfade transaction ended without swapping the track
    CrossfadeSkipped {
        layer_id: String,
        track_id: String,
        reason: SkipReason,
        timestamp: DateTime<Utc>,
    },

    /// Volume ramp reached its target
    RampCompleted {
        layer_id: String,
        volume: f32,
        timestamp: DateTime<Utc>,
    },

    /// Volume ramp stopped early (manual override, newer ramp or cancel)
    RampInterrupted {
        layer_id: String,
        volume: f32,
        timestamp: DateTime<Utc>,
    },

    /// Layer volume set directly by the user
    LayerVolumeChanged {
        layer_id: String,
        volume: f32,
        timestamp: DateTime<Utc>,
    },

    /// Phase transition began
    PhaseTransitionStarted {
        from_phase_id: Option<String>,
        to_phase_id: String,
        track_changes: usize,
        volume_changes: usize,
        timestamp: DateTime<Utc>,
    },

    /// Phase transition settled (all crossfades and ramps resolved)
    PhaseTransitionSettled {
        phase_id: String,
        failed_layers: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Phase transition hit the safety timeout
    PhaseTransitionTimedOut {
        phase_id: String,
        timeout_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Phase list replaced via update_phases
    PhasesUpdated {
        phase_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Phase captured (or cleared) its layer state snapshot
    PhaseCaptured {
        phase_id: String,
        cleared: bool,
        timestamp: DateTime<Utc>,
    },

    /// Timeline reset: ramps cancelled, layers idle, clock cleared
    TimelineReset {
        timestamp: DateTime<Utc>,
    },
}

impl TapEvent {
    /// Short name of the event variant, for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            TapEvent::ClockStateChanged { .. } => "ClockStateChanged",
            TapEvent::ClockSeeked { .. } => "ClockSeeked",
            TapEvent::Progress { .. } => "Progress",
            TapEvent::PreloadProgress { .. } => "PreloadProgress",
            TapEvent::CrossfadeStarted { .. } => "CrossfadeStarted",
            TapEvent::CrossfadeCompleted { .. } => "CrossfadeCompleted",
            TapEvent::CrossfadeSkipped { .. } => "CrossfadeSkipped",
            TapEvent::RampCompleted { .. } => "RampCompleted",
            TapEvent::RampInterrupted { .. } => "RampInterrupted",
            TapEvent::LayerVolumeChanged { .. } => "LayerVolumeChanged",
            TapEvent::PhaseTransitionStarted { .. } => "PhaseTransitionStarted",
            TapEvent::PhaseTransitionSettled { .. } => "PhaseTransitionSettled",
            TapEvent::PhaseTransitionTimedOut { .. } => "PhaseTransitionTimedOut",
            TapEvent::PhasesUpdated { .. } => "PhasesUpdated",
            TapEvent::PhaseCaptured { .. } => "PhaseCaptured",
            TapEvent::TimelineReset { .. } => "TimelineReset",
        }
    }
}

/// One-to-many event broadcaster
///
/// Thin wrapper over a tokio broadcast channel. Slow subscribers lose the
/// oldest events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TapEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use tap_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(256);
    /// assert_eq!(event_bus.capacity(), 256);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<TapEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the number of subscribers that received it. Having no
    /// subscribers is not an error for the engine.
    pub fn emit(&self, event: TapEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let delivered = bus.emit(TapEvent::TimelineReset { timestamp: now() });
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "TimelineReset");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.emit(TapEvent::TimelineReset { timestamp: now() }), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = TapEvent::CrossfadeSkipped {
            layer_id: "drone".to_string(),
            track_id: "t2".to_string(),
            reason: SkipReason::LoadFailed,
            timestamp: now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CrossfadeSkipped");
        assert_eq!(json["reason"], "load_failed");
        assert_eq!(json["layer_id"], "drone");
    }

    #[test]
    fn test_clock_state_display() {
        assert_eq!(ClockState::Running.to_string(), "Running");
        assert_eq!(ClockState::Paused.to_string(), "Paused");
    }
}
