//! Binary heap merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of runs (inputs).
///
/// Equal items are yielded in the order of the runs they come from, which makes the output
/// deterministic for a given runs order. The first error returned by any run is yielded once,
/// after which the merger is exhausted.
pub struct BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap,
    // the run index breaks ties and locates the run to be advanced
    items: BinaryHeap<Reverse<(T, usize)>>,
    runs: Vec<C::IntoIter>,
    initiated: bool,
    failed: bool,
}

impl<T, E, C> BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using runs as inputs.
    /// Run items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `runs` - Runs to be merged in a single sorted one
    pub fn new<I>(runs: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let runs = Vec::from_iter(runs.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(runs.len());

        return BinaryHeapMerger {
            runs,
            items,
            initiated: false,
            failed: false,
        };
    }

    /// Number of runs that still have items to merge.
    pub fn active_runs(&self) -> usize {
        self.items.len()
    }

    fn advance(&mut self, idx: usize) -> Result<(), E> {
        if let Some(item) = self.runs[idx].next() {
            self.items.push(Reverse((item?, idx)));
        }

        return Ok(());
    }
}

impl<T, E, C> Iterator for BinaryHeapMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.runs.len() {
                if let Err(err) = self.advance(idx) {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }

        let Reverse((result, idx)) = self.items.pop()?;
        if let Err(err) = self.advance(idx) {
            self.failed = true;
            return Some(Err(err));
        }

        return Some(Ok(result));
    }
}
