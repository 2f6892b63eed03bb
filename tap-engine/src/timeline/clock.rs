//! Session clock
//!
//! Pure timekeeper: it is driven alongside audio playback but never starts
//! playback itself. Elapsed time is derived from the wall-clock distance to
//! the last start/resume/seek, never accumulated tick by tick, so a suspended
//! process catches up on the next tick instead of drifting.
//!
//! [`SessionClock::tick`] samples the wall clock once per scheduling tick;
//! [`SessionClock::elapsed_ms`] returns that sample, so every reader within
//! a tick sees the same value.

use crate::ports::Clock;
use std::sync::Arc;
use tap_common::events::ClockState;
use tracing::{debug, warn};

pub struct SessionClock {
    clock: Arc<dyn Clock>,
    total_duration_ms: u64,
    state: ClockState,
    /// Elapsed time at the last start/resume/seek
    base_elapsed_ms: u64,
    /// Wall clock at the last start/resume/seek while running
    anchor_wall_ms: Option<u64>,
    /// Value sampled by the last tick
    elapsed_ms: u64,
    last_tick_wall_clock: u64,
}

impl SessionClock {
    pub fn new(clock: Arc<dyn Clock>, total_duration_ms: u64) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            total_duration_ms,
            state: ClockState::Stopped,
            base_elapsed_ms: 0,
            anchor_wall_ms: None,
            elapsed_ms: 0,
            last_tick_wall_clock: now,
        }
    }

    /// Sample the wall clock and refresh the elapsed value
    pub fn tick(&mut self) -> u64 {
        let now = self.clock.now_ms();
        self.last_tick_wall_clock = now;
        if let (ClockState::Running, Some(anchor)) = (self.state, self.anchor_wall_ms) {
            let elapsed = self.base_elapsed_ms + now.saturating_sub(anchor);
            self.elapsed_ms = elapsed.min(self.total_duration_ms);
        }
        self.elapsed_ms
    }

    /// Start the clock
    ///
    /// No-op (returns false) if already running and `reset` is false.
    pub fn start(&mut self, reset: bool) -> bool {
        if self.state == ClockState::Running && !reset {
            debug!("Session clock already running, start ignored");
            return false;
        }
        if reset {
            self.base_elapsed_ms = 0;
            self.elapsed_ms = 0;
        } else {
            self.base_elapsed_ms = self.elapsed_ms;
        }
        self.anchor_wall_ms = Some(self.clock.now_ms());
        self.state = ClockState::Running;
        true
    }

    /// Freeze elapsed time, keeping the position
    pub fn pause(&mut self) -> bool {
        if self.state != ClockState::Running {
            return false;
        }
        self.tick();
        self.base_elapsed_ms = self.elapsed_ms;
        self.anchor_wall_ms = None;
        self.state = ClockState::Paused;
        true
    }

    /// Continue from the frozen position
    pub fn resume(&mut self) -> bool {
        if self.state != ClockState::Paused {
            if self.state == ClockState::Stopped {
                warn!("Resume on a stopped session clock ignored; use start");
            }
            return false;
        }
        self.anchor_wall_ms = Some(self.clock.now_ms());
        self.state = ClockState::Running;
        true
    }

    /// Stop the clock, clearing the position unless `keep_position`
    pub fn stop(&mut self, keep_position: bool) -> bool {
        let was = self.state;
        self.tick();
        self.anchor_wall_ms = None;
        self.state = ClockState::Stopped;
        if keep_position {
            self.base_elapsed_ms = self.elapsed_ms;
        } else {
            self.base_elapsed_ms = 0;
            self.elapsed_ms = 0;
        }
        was != ClockState::Stopped
    }

    /// Jump to an absolute time, clamped to `[0, total_duration]`
    ///
    /// While not running this only moves the base offset.
    pub fn seek_to_time(&mut self, ms: i64) -> u64 {
        let clamped = u64::try_from(ms).unwrap_or(0).min(self.total_duration_ms);
        if i64::try_from(clamped).ok() != Some(ms) {
            warn!(
                "Seek to {}ms outside session [0, {}], clamped to {}ms",
                ms, self.total_duration_ms, clamped
            );
        }
        self.set_position(clamped);
        clamped
    }

    fn set_position(&mut self, ms: u64) {
        self.base_elapsed_ms = ms;
        self.elapsed_ms = ms;
        if self.state == ClockState::Running {
            self.anchor_wall_ms = Some(self.clock.now_ms());
        }
    }

    /// Jump to a percentage of the session duration
    pub fn seek_to_percent(&mut self, pct: f64) -> u64 {
        let pct = if pct.is_nan() {
            warn!("Seek to NaN percent treated as 0");
            0.0
        } else {
            pct
        };
        let clamped = pct.clamp(0.0, 100.0);
        if clamped != pct {
            warn!("Seek to {}% clamped to {}%", pct, clamped);
        }
        let ms = (self.total_duration_ms as f64 * clamped / 100.0).round() as i64;
        self.seek_to_time(ms)
    }

    /// Elapsed time as of the last tick
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Progress through the session in percent
    pub fn progress_pct(&self) -> f64 {
        if self.total_duration_ms == 0 {
            return 0.0;
        }
        self.elapsed_ms as f64 / self.total_duration_ms as f64 * 100.0
    }

    pub fn set_total_duration(&mut self, total_duration_ms: u64) {
        self.tick();
        self.total_duration_ms = total_duration_ms;
        if self.elapsed_ms > total_duration_ms {
            self.set_position(total_duration_ms);
        }
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ClockState::Running
    }

    /// True once a running clock has reached the end of the session
    pub fn is_finished(&self) -> bool {
        self.elapsed_ms >= self.total_duration_ms
    }

    pub fn last_tick_wall_clock(&self) -> u64 {
        self.last_tick_wall_clock
    }
}
