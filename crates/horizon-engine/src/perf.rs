//! Frame timing for headless runs.

use std::collections::VecDeque;

/// Rolling frame-time statistics.
#[derive(Debug)]
pub struct PerfMetrics {
    /// Recent update times in seconds
    update_times: VecDeque<f32>,
    /// Recent render times in seconds
    render_times: VecDeque<f32>,
    /// History size for averaging
    history_size: usize,
    /// Worst update time seen
    worst_update: f32,
    /// Frames recorded
    frames: u64,
}

impl Default for PerfMetrics {
    fn default() -> Self {
        Self::new(120)
    }
}

impl PerfMetrics {
    /// Creates a collector that averages over `history_size` frames.
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        let history_size = history_size.max(1);
        Self {
            update_times: VecDeque::with_capacity(history_size),
            render_times: VecDeque::with_capacity(history_size),
            history_size,
            worst_update: 0.0,
            frames: 0,
        }
    }

    /// Records one frame.
    pub fn record_frame(&mut self, update: f32, render: f32) {
        push_bounded(&mut self.update_times, update, self.history_size);
        push_bounded(&mut self.render_times, render, self.history_size);
        self.worst_update = self.worst_update.max(update);
        self.frames += 1;
    }

    /// Average update time in milliseconds.
    #[must_use]
    pub fn avg_update_ms(&self) -> f32 {
        average(&self.update_times) * 1000.0
    }

    /// Average render time in milliseconds.
    #[must_use]
    pub fn avg_render_ms(&self) -> f32 {
        average(&self.render_times) * 1000.0
    }

    /// Worst update time in milliseconds.
    #[must_use]
    pub fn worst_update_ms(&self) -> f32 {
        self.worst_update * 1000.0
    }

    /// Frames recorded.
    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.frames
    }
}

fn push_bounded(samples: &mut VecDeque<f32>, value: f32, limit: usize) {
    samples.push_back(value);
    if samples.len() > limit {
        samples.pop_front();
    }
}

fn average(samples: &VecDeque<f32>) -> f32 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f32>() / samples.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        let mut perf = PerfMetrics::new(2);
        perf.record_frame(0.001, 0.0);
        perf.record_frame(0.003, 0.0);
        perf.record_frame(0.005, 0.002);
        assert!((perf.avg_update_ms() - 4.0).abs() < 1e-3);
        assert!((perf.avg_render_ms() - 1.0).abs() < 1e-3);
        assert!((perf.worst_update_ms() - 5.0).abs() < 1e-3);
        assert_eq!(perf.frames(), 3);
    }

    #[test]
    fn test_empty_metrics() {
        let perf = PerfMetrics::default();
        assert!(perf.avg_update_ms().abs() < f32::EPSILON);
        assert_eq!(perf.frames(), 0);
    }
}
