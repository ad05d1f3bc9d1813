//! Transfer speed over a sliding time window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

/// Bytes that moved at one instant.
#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Speed of one transfer, averaged over the samples inside the window.
///
/// Each acknowledged chunk (upload) or written chunk (download) adds one
/// sample; older samples fall out of the window or past `max_samples`.
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    samples: VecDeque<Sample>,
    window: Duration,
    max_samples: usize,
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Records `bytes` moved just now.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&mut self, bytes: u64, at: Instant) {
        self.samples.push_back(Sample { at, bytes });
        while let Some(oldest) = self.samples.front()
            && (at.duration_since(oldest.at) > self.window || self.samples.len() > self.max_samples)
        {
            self.samples.pop_front();
        }
    }

    /// Average bytes per second across the window; 0.0 until two samples
    /// some time apart exist.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.duration_since(first.at);
        if elapsed.is_zero() {
            return 0.0;
        }
        // The oldest sample opens the window; its bytes moved before it.
        let bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }
}
