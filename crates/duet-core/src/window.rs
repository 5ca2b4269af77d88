//! Bounded sample windows
//!
//! Every time series Duet keeps is a [`SlidingWindow`]: append-only with
//! oldest-first eviction once the capacity is reached, so memory stays
//! bounded for arbitrarily long calls.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Round-trip time sample, in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RttSample {
    pub timestamp: f64,
    pub rtt: f64,
    /// Transport-reported jitter; absent for side-channel probes
    pub jitter: Option<f64>,
}

/// Capture-to-render delay sample, in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameDelaySample {
    pub timestamp: f64,
    pub delay: f64,
    /// Decoded-frame counter at the time of the sample
    pub frame_seq: u64,
}

/// Instantaneous outbound bitrate
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BitrateSample {
    pub timestamp: f64,
    pub kbps: f64,
}

/// Fixed-capacity FIFO of samples
#[derive(Clone, Debug)]
pub struct SlidingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> SlidingWindow<T> {
    /// Create a window holding at most `capacity` samples (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, returning the evicted oldest sample if the window was full
    pub fn push(&mut self, sample: T) -> Option<T> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently appended sample
    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    /// All samples, oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.samples.iter()
    }

    /// The last `n` samples, oldest first
    pub fn recent(&self, n: usize) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.range(skip..)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
