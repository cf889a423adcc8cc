//! Bounded, ordered history of log lines for a single tailed target.

use std::collections::VecDeque;

/// Default number of lines a [`LogBuffer`] retains.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded FIFO history of decoded log lines.
///
/// New lines are appended at the tail; once the buffer holds more than
/// `capacity` lines, the oldest are evicted from the head. The total number
/// of evicted lines is tracked so a consumer replaying a snapshot can tell
/// (approximately) how much history it missed.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: u64,
}

impl LogBuffer {
    /// Constructs a buffer with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Constructs a buffer retaining at most `capacity` lines.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be at least 1");
        LogBuffer {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Appends `lines` at the tail, evicting from the head until the buffer
    /// is back within capacity. Always succeeds.
    pub fn append<I>(&mut self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        for line in lines {
            self.lines.push_back(line);
        }
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }
    }

    /// Returns a copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Discards all stored lines. The eviction counter is unaffected.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Number of lines currently stored.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Maximum number of lines retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of lines dropped from the head since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
