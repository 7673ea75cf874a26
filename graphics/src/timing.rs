//! Frame timing summary for debug panels and logs.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of frames averaged by default.
pub const DEFAULT_WINDOW: usize = 60;

/// Snapshot of recent frame timing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTimingSummary {
    /// Frames per second over the averaging window.
    pub fps: f32,
    /// Average frame time in milliseconds.
    pub average_frame_time_ms: f32,
    /// Total frames ticked.
    pub frame_count: u64,
}

/// Moving average of frame delta times.
#[derive(Debug)]
pub struct FrameTimer {
    frame_times: VecDeque<f32>,
    window: usize,
    last_tick: Option<Instant>,
    frame_count: u64,
}

impl FrameTimer {
    /// Create a timer averaging over [`DEFAULT_WINDOW`] frames.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Create a timer averaging over `window` frames.
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            frame_times: VecDeque::with_capacity(window),
            window,
            last_tick: None,
            frame_count: 0,
        }
    }

    /// Mark the start of a frame and return the delta time since the previous
    /// one in seconds. The first tick returns zero.
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        match self.last_tick.replace(now) {
            Some(last) => {
                let dt = now.duration_since(last);
                self.record(dt);
                dt.as_secs_f32()
            }
            None => {
                self.frame_count += 1;
                0.0
            }
        }
    }

    /// Record an externally measured frame duration.
    pub fn record(&mut self, frame_time: Duration) {
        if self.frame_times.len() >= self.window {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(frame_time.as_secs_f32());
        self.frame_count += 1;
        profile_plot!("frame_time_ms", frame_time.as_secs_f64() * 1000.0);
    }

    /// Current summary.
    pub fn summary(&self) -> FrameTimingSummary {
        if self.frame_times.is_empty() {
            return FrameTimingSummary {
                frame_count: self.frame_count,
                ..Default::default()
            };
        }
        let average = self.frame_times.iter().sum::<f32>() / self.frame_times.len() as f32;
        FrameTimingSummary {
            fps: if average > 0.0 { 1.0 / average } else { 0.0 },
            average_frame_time_ms: average * 1000.0,
            frame_count: self.frame_count,
        }
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let timer = FrameTimer::new();
        assert_eq!(timer.summary(), FrameTimingSummary::default());
    }

    #[test]
    fn test_average() {
        let mut timer = FrameTimer::with_window(4);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));
        let summary = timer.summary();
        assert!((summary.average_frame_time_ms - 20.0).abs() < 0.01);
        assert!((summary.fps - 50.0).abs() < 0.1);
        assert_eq!(summary.frame_count, 2);
    }

    #[test]
    fn test_window_drops_oldest() {
        let mut timer = FrameTimer::with_window(2);
        timer.record(Duration::from_millis(100));
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(10));
        assert!((timer.summary().average_frame_time_ms - 10.0).abs() < 0.01);
        assert_eq!(timer.summary().frame_count, 3);
    }

    #[test]
    fn test_first_tick_is_zero() {
        let mut timer = FrameTimer::new();
        assert_eq!(timer.tick(), 0.0);
        assert_eq!(timer.summary().frame_count, 1);
    }
}
