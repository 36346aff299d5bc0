//! Identifier offset allocation
//!
//! Every stream shares the same `1..=max_targets` identifier range, so the
//! value handed to the classifier and used as route mark is shifted by a
//! per-stream offset. The generator hands out non-overlapping intervals
//! `[offset, offset + max_targets)` out of a shared `u32` space using a
//! first-fit search.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OffsetError {
    #[error("identifier offset space exhausted for stream '{stream}' (max targets {max_targets})")]
    Exhausted { stream: String, max_targets: u32 },

    #[error("stream '{0}' requested an empty identifier range")]
    EmptyRange(String),
}

/// Allocated interval, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    start: u32,
    end: u32,
}

impl Interval {
    fn overlaps(&self, start: u32, end: u32) -> bool {
        start <= self.end && end >= self.start
    }
}

#[derive(Debug)]
pub struct IdentifierOffsetGenerator {
    base: u32,
    intervals: Mutex<BTreeMap<String, Interval>>,
}

impl IdentifierOffsetGenerator {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            intervals: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the offset for `stream`, allocating one when the stream has
    /// none yet. Repeated calls for the same stream return the same offset.
    pub fn generate(&self, stream: &str, max_targets: u32) -> Result<u32, OffsetError> {
        if max_targets == 0 {
            return Err(OffsetError::EmptyRange(stream.to_string()));
        }

        let mut intervals = self.intervals.lock();
        if let Some(existing) = intervals.get(stream) {
            return Ok(existing.start);
        }

        let exhausted = || OffsetError::Exhausted {
            stream: stream.to_string(),
            max_targets,
        };

        let mut start = self.base;
        'search: loop {
            // Activation values run up to `start + max_targets`.
            start.checked_add(max_targets).ok_or_else(exhausted)?;
            let end = start + (max_targets - 1);

            for interval in intervals.values() {
                if interval.overlaps(start, end) {
                    start = interval.end.checked_add(1).ok_or_else(exhausted)?;
                    // Moving past one interval can collide with one already
                    // checked, so rescan from the top.
                    continue 'search;
                }
            }
            break;
        }

        let end = start + (max_targets - 1);
        intervals.insert(stream.to_string(), Interval { start, end });
        debug!(stream, offset = start, max_targets, "Allocated identifier offset");
        Ok(start)
    }

    /// Frees the interval of `stream` for later allocations.
    pub fn release(&self, stream: &str) {
        if let Some(interval) = self.intervals.lock().remove(stream) {
            debug!(
                stream,
                offset = interval.start,
                "Released identifier offset"
            );
        }
    }

    pub fn offset_of(&self, stream: &str) -> Option<u32> {
        self.intervals.lock().get(stream).map(|i| i.start)
    }

    pub fn len(&self) -> usize {
        self.intervals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
