use std::collections::VecDeque;
use std::time::Duration;

/// Sliding window of recent page durations used for the time estimate.
#[derive(Debug)]
pub(crate) struct EtaWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl EtaWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: Duration = self.samples.iter().sum();
        Some(sum / self.samples.len() as u32)
    }
}

/// Minutes left at `per_page_time` for `remaining` messages fetched
/// `page_len` at a time. Rounded up so anything outstanding shows as >= 1.
pub fn estimate_minutes_remaining(per_page_time: Duration, remaining: u64, page_len: usize) -> u64 {
    if remaining == 0 {
        return 0;
    }
    let page_len = page_len.max(1) as u64;
    let pages = remaining.div_ceil(page_len);
    let seconds = per_page_time.as_secs_f64() * pages as f64;
    (seconds / 60.0).ceil().max(1.0) as u64
}

pub(crate) fn percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((processed as f64 / total as f64) * 100.0).min(100.0)
}
