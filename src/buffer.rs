//! Memory-bounded run buffer.

use rayon;

use crate::record::RecordFormat;

const MIN_GROWTH: usize = 1024;

/// Run buffer builder.
///
/// The memory budget counts records at their on-disk width. Records are held in memory as [`i64`],
/// so a buffer of a narrower record format occupies up to `8 / width` times the budget.
#[derive(Debug, Clone, Copy)]
pub struct RunBufferBuilder {
    records_limit: usize,
}

impl RunBufferBuilder {
    pub fn new(records_limit: usize) -> Self {
        RunBufferBuilder { records_limit }
    }

    /// Creates a builder of buffers holding as many records as fit into `memory_budget` bytes.
    /// Returns [`None`] if the budget is too small to hold a single record.
    pub fn from_memory_budget(memory_budget: u64, format: RecordFormat) -> Option<Self> {
        let records_limit = memory_budget / format.width() as u64;
        if records_limit == 0 {
            return None;
        }

        let records_limit = usize::try_from(records_limit).unwrap_or(usize::MAX);
        return Some(RunBufferBuilder::new(records_limit));
    }

    /// Maximum number of records a buffer holds.
    pub fn records_limit(&self) -> usize {
        self.records_limit
    }

    /// Creates a new buffer.
    pub fn build(&self) -> RunBuffer {
        RunBuffer::new(self.records_limit)
    }
}

/// Buffer limited by records count.
/// Its capacity grows geometrically as records are pushed but never exceeds the limit,
/// so short inputs do not allocate the whole budget.
pub struct RunBuffer {
    limit: usize,
    inner: Vec<i64>,
}

impl RunBuffer {
    pub fn new(limit: usize) -> Self {
        RunBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    /// Adds a new record to the buffer.
    pub fn push(&mut self, record: i64) {
        if self.inner.len() == self.inner.capacity() {
            let additional = self
                .inner
                .capacity()
                .max(MIN_GROWTH)
                .min(self.limit.saturating_sub(self.inner.len()))
                .max(1);
            self.inner.reserve_exact(additional);
        }
        self.inner.push(record);
    }

    /// Number of records the buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }
}

impl IntoIterator for RunBuffer {
    type Item = i64;
    type IntoIter = <Vec<i64> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl rayon::slice::ParallelSliceMut<i64> for RunBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [i64] {
        self.inner.as_mut_slice()
    }
}
