//! `int-ext-sort` is an external k-way merge sort of binary files of fixed-width integers.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is achieved in two passes. During the
//! first pass the input is split into runs that each fit the memory budget, every run is sorted in memory and
//! saved to a temporary file. During the second pass the runs are merged together using a binary heap
//! holding the current head record of each run. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `int-ext-sort` supports the following features:
//!
//! * **Record layouts:**
//!   signed integers of 1, 2, 4 or 8 bytes in little, big or native byte order.
//! * **Memory budget:**
//!   no more records than fit into the configured number of bytes are held in memory while runs are produced.
//! * **Multithreading support:**
//!   runs are sorted in multiple threads utilizing maximum CPU resources and reducing sorting time.
//! * **Cleanup:**
//!   temporary runs are removed whether sorting succeeds, fails or gets cancelled.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use log;
//!
//! use int_ext_sort::{ExternalSorter, ExternalSorterBuilder};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_memory_budget(50 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter
//!         .sort_file(Path::new("input.bin"), Path::new("output.bin"))
//!         .unwrap();
//!
//!     log::info!("{} records sorted", stats.records);
//! }
//! ```

use std::path::Path;

pub mod buffer;
pub mod cancel;
pub mod merger;
pub mod record;
pub mod run;
pub mod sort;
pub mod verify;

pub use buffer::{RunBuffer, RunBufferBuilder};
pub use cancel::CancellationToken;
pub use merger::BinaryHeapMerger;
pub use record::{ByteOrder, RecordFormat, RecordReader, RecordWidth, RecordWriter, TrailingBytes};
pub use run::{ExternalRun, RunReader, RunSet};
pub use sort::{ExternalSorter, ExternalSorterBuilder, Phase, SortConfig, SortError, SortStats};
pub use verify::{check_sorted, VerifyReport};

/// Sorts records of the `input` file and saves them to the `output` file using the provided configuration.
/// All temporary data is removed before the function returns.
pub fn sort_file(config: SortConfig, input: &Path, output: &Path) -> Result<SortStats, SortError> {
    let sorter = ExternalSorterBuilder::from_config(config).build()?;
    sorter.sort_file(input, output)
}
