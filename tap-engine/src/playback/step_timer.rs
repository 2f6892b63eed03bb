//! Fixed-step pacing for gain changes

use std::time::Duration;
use tap_common::FadeCurve;
use tokio::time::{interval_at, Instant, Interval};

/// Splits a duration into evenly spaced steps
///
/// `ceil(duration / step)` steps, spread so the last one lands exactly at
/// `duration`. A zero duration is a single step that fires immediately.
pub(crate) struct StepTimer {
    ticker: Option<Interval>,
    steps: u32,
    index: u32,
}

impl StepTimer {
    pub(crate) fn new(duration_ms: u64, step_ms: u64) -> Self {
        if duration_ms == 0 {
            return Self {
                ticker: None,
                steps: 1,
                index: 0,
            };
        }

        let step_ms = step_ms.max(1);
        let steps = duration_ms.div_ceil(step_ms).clamp(1, u32::MAX as u64) as u32;
        let period = Duration::from_millis(duration_ms) / steps;
        Self {
            ticker: Some(interval_at(Instant::now() + period, period)),
            steps,
            index: 0,
        }
    }

    pub(crate) fn steps(&self) -> u32 {
        self.steps
    }

    /// Advance to the next step, returning its normalized position
    pub(crate) fn next_position(&mut self) -> Option<f32> {
        if self.index >= self.steps {
            return None;
        }
        self.index += 1;
        Some(FadeCurve::step_position(self.index, self.steps))
    }

    /// Wait until the current step is due
    pub(crate) async fn wait(&mut self) {
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.tick().await;
        }
    }

    pub(crate) fn is_last(&self) -> bool {
        self.index == self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_count_rounds_up() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            assert_eq!(StepTimer::new(1000, 50).steps(), 20);
            assert_eq!(StepTimer::new(1010, 50).steps(), 21);
            assert_eq!(StepTimer::new(10, 50).steps(), 1);
            assert_eq!(StepTimer::new(0, 50).steps(), 1);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_positions_end_at_one() {
        let mut timer = StepTimer::new(200, 50);
        let mut positions = Vec::new();
        while let Some(p) = timer.next_position() {
            timer.wait().await;
            positions.push(p);
        }
        assert_eq!(positions, vec![0.25, 0.5, 0.75, 1.0]);
        assert!(timer.is_last());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_time_matches_duration() {
        let start = Instant::now();
        let mut timer = StepTimer::new(1010, 50);
        while timer.next_position().is_some() {
            timer.wait().await;
        }
        assert_eq!(start.elapsed(), Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_does_not_wait() {
        let start = Instant::now();
        let mut timer = StepTimer::new(0, 50);
        assert_eq!(timer.next_position(), Some(1.0));
        timer.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(timer.next_position(), None);
    }
}
