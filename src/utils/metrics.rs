//! Bounded metric buffers and summary statistics.

use std::collections::VecDeque;

use serde::Serialize;

pub const MAX_POINTS: usize = 1_000;

/// Appends value to buffer; drops the oldest once at capacity.
#[inline]
pub fn push_capped(buf: &mut VecDeque<f64>, val: f64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Min, max and mean over the finite values of `data`.
pub fn calculate_stats<'a>(data: impl IntoIterator<Item = &'a f64>) -> Option<Stats> {
    let mut count = 0usize;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for &x in data.into_iter().filter(|x| x.is_finite()) {
        count += 1;
        min = min.min(x);
        max = max.max(x);
        sum += x;
    }
    if count == 0 {
        return None;
    }
    Some(Stats {
        min,
        max,
        mean: sum / count as f64,
        count,
    })
}

/// Most recent round-trip times, in seconds.
#[derive(Debug, Clone, Default)]
pub struct RttWindow {
    samples: VecDeque<f64>,
    total: u64,
}

impl RttWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rtt_s: f64) {
        push_capped(&mut self.samples, rtt_s);
        self.total += 1;
    }

    /// Replies observed since construction, not just those still buffered.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn stats(&self) -> Option<Stats> {
        calculate_stats(&self.samples)
    }
}
