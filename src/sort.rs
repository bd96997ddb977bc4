//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use rayon::slice::ParallelSliceMut;

use crate::buffer::{RunBuffer, RunBufferBuilder};
use crate::cancel::CancellationToken;
use crate::merger::BinaryHeapMerger;
use crate::record::{ByteOrder, PartialRecord, RecordFormat, RecordReader, RecordWidth, RecordWriter, TrailingBytes};
use crate::run::{ExternalRun, RunSet};

/// Default memory budget: 100 MiB.
pub const DEFAULT_MEMORY_BUDGET: u64 = 100 * 1024 * 1024;

/// Sorting phase an I/O error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading the input stream.
    Input,
    /// Writing sorted runs.
    Partition,
    /// Reading and removing sorted runs.
    Merge,
    /// Writing the output stream.
    Output,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Input => write!(f, "input reading"),
            Phase::Partition => write!(f, "run writing"),
            Phase::Merge => write!(f, "runs merging"),
            Phase::Output => write!(f, "output writing"),
        }
    }
}

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Memory budget is too small to hold a single record.
    MemoryBudget { memory_budget: u64, record_width: usize },
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input length is not a multiple of the record width.
    MalformedInput { trailing_bytes: u64, record_width: usize },
    /// I/O error.
    IO {
        phase: Phase,
        run: Option<usize>,
        source: io::Error,
    },
    /// Storage space exhausted.
    StorageFull {
        phase: Phase,
        run: Option<usize>,
        source: io::Error,
    },
    /// Sorting cancelled through a [`CancellationToken`].
    Cancelled,
}

impl SortError {
    /// Wraps an I/O error raised during the `phase` while handling the `run` (if any).
    /// A partial record met while reading the input is reported as malformed input.
    pub fn io(phase: Phase, run: Option<usize>, err: io::Error) -> Self {
        if phase == Phase::Input {
            if let Some(partial) = PartialRecord::from_io_error(&err) {
                return SortError::MalformedInput {
                    trailing_bytes: partial.bytes as u64,
                    record_width: partial.record_width,
                };
            }
        }

        if err.kind() == io::ErrorKind::StorageFull {
            SortError::StorageFull {
                phase,
                run,
                source: err,
            }
        } else {
            SortError::IO {
                phase,
                run,
                source: err,
            }
        }
    }

    /// Checks if the error is caused by an invalid sorter configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SortError::MemoryBudget { .. } | SortError::TempDir(_) | SortError::ThreadPoolBuildError(_)
        )
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO { source, .. } => Some(source),
            SortError::StorageFull { source, .. } => Some(source),
            SortError::MemoryBudget { .. } | SortError::MalformedInput { .. } | SortError::Cancelled => None,
        }
    }
}

struct RunLabel(Option<usize>);

impl Display for RunLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(run) => write!(f, " (run {})", run),
            None => Ok(()),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::MemoryBudget {
                memory_budget,
                record_width,
            } => write!(
                f,
                "memory budget of {} byte(s) cannot hold a single {}-byte record",
                memory_budget, record_width
            ),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::MalformedInput {
                trailing_bytes,
                record_width,
            } => write!(
                f,
                "malformed input: {} trailing byte(s) do not form a complete {}-byte record",
                trailing_bytes, record_width
            ),
            SortError::IO { phase, run, source } => {
                write!(f, "I/O operation failed during {}{}: {}", phase, RunLabel(*run), source)
            }
            SortError::StorageFull { phase, run, source } => {
                write!(f, "storage exhausted during {}{}: {}", phase, RunLabel(*run), source)
            }
            SortError::Cancelled => write!(f, "sorting cancelled"),
        }
    }
}

/// Sorting configuration.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Record width.
    pub record_width: RecordWidth,
    /// Records byte order.
    pub byte_order: ByteOrder,
    /// Maximum size in bytes of a run, counted at the record width.
    /// A run holds `memory_budget / record width` records.
    pub memory_budget: u64,
    /// Directory to be used to store temporary data. OS temporary directory if [`None`].
    pub tmp_dir: Option<PathBuf>,
    /// Input trailing partial record handling policy.
    pub trailing_bytes: TrailingBytes,
    /// Number of threads to be used to sort runs. Selected based on CPU cores number if [`None`].
    pub threads_number: Option<usize>,
    /// Runs and streams read/write buffer size.
    pub rw_buf_size: Option<usize>,
}

impl SortConfig {
    /// Records binary layout.
    pub fn format(&self) -> RecordFormat {
        RecordFormat::new(self.record_width, self.byte_order)
    }
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            record_width: RecordWidth::default(),
            byte_order: ByteOrder::default(),
            memory_budget: DEFAULT_MEMORY_BUDGET,
            tmp_dir: None,
            trailing_bytes: TrailingBytes::default(),
            threads_number: None,
            rw_buf_size: None,
        }
    }
}

/// Sorting summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortStats {
    /// Number of sorted records.
    pub records: u64,
    /// Number of runs the input was split into.
    pub runs: usize,
    /// Number of input trailing bytes dropped.
    pub truncated_bytes: u64,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone, Default)]
pub struct ExternalSorterBuilder {
    config: SortConfig,
    cancellation_token: CancellationToken,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Creates an instance of a builder using the provided configuration.
    pub fn from_config(config: SortConfig) -> Self {
        ExternalSorterBuilder {
            config,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        ExternalSorter::new(self.config, self.cancellation_token)
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.config.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.config.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets maximum size in bytes of the records held in memory at once.
    pub fn with_memory_budget(mut self, memory_budget: u64) -> ExternalSorterBuilder {
        self.config.memory_budget = memory_budget;
        return self;
    }

    /// Sets record width.
    pub fn with_record_width(mut self, record_width: RecordWidth) -> ExternalSorterBuilder {
        self.config.record_width = record_width;
        return self;
    }

    /// Sets records byte order.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> ExternalSorterBuilder {
        self.config.byte_order = byte_order;
        return self;
    }

    /// Sets input trailing partial record handling policy.
    pub fn with_trailing_bytes(mut self, trailing_bytes: TrailingBytes) -> ExternalSorterBuilder {
        self.config.trailing_bytes = trailing_bytes;
        return self;
    }

    /// Sets runs read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder {
        self.config.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets a token the sorting can be cancelled with.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> ExternalSorterBuilder {
        self.cancellation_token = token;
        return self;
    }
}

/// External sorter.
pub struct ExternalSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
    /// Run buffer builder.
    buffer_builder: RunBufferBuilder,
    /// Records binary layout.
    format: RecordFormat,
    /// Input trailing partial record handling policy.
    trailing_bytes: TrailingBytes,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Cancellation flag.
    cancellation_token: CancellationToken,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `config` - Sorting configuration
    /// * `cancellation_token` - Token the sorting can be cancelled with
    pub fn new(config: SortConfig, cancellation_token: CancellationToken) -> Result<Self, SortError> {
        let format = config.format();
        let buffer_builder = RunBufferBuilder::from_memory_budget(config.memory_budget, format).ok_or(
            SortError::MemoryBudget {
                memory_budget: config.memory_budget,
                record_width: format.width(),
            },
        )?;
        log::info!(
            "run size: {} records of {} byte(s)",
            buffer_builder.records_limit(),
            format.width()
        );

        return Ok(ExternalSorter {
            buffer_builder,
            format,
            trailing_bytes: config.trailing_bytes,
            rw_buf_size: config.rw_buf_size,
            thread_pool: Self::init_thread_pool(config.threads_number)?,
            tmp_dir: Self::init_tmp_directory(config.tmp_dir.as_deref())?,
            cancellation_token,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// Directory the runs are stored in. Removed when the sorter is dropped.
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Records binary layout.
    pub fn format(&self) -> RecordFormat {
        self.format
    }

    fn check_cancelled(&self) -> Result<(), SortError> {
        if self.cancellation_token.is_cancelled() {
            log::warn!("sorting cancelled");
            return Err(SortError::Cancelled);
        }

        return Ok(());
    }

    /// Sorts records from the input stream and writes them to the output stream.
    ///
    /// If the merge fails the records written to the output so far are left in place.
    pub fn sort<R, W>(&self, input: R, output: W) -> Result<SortStats, SortError>
    where
        R: Read,
        W: Write,
    {
        let run_set = self.partition(input)?;
        let runs = run_set.len();
        let truncated_bytes = run_set.truncated_bytes();

        let records = self.merge(run_set, output)?;

        return Ok(SortStats {
            records,
            runs,
            truncated_bytes,
        });
    }

    /// Sorts records of the `input` file and saves them to the `output` file.
    ///
    /// The output is written to a temporary file in the output directory and moved
    /// in place only if sorting succeeds.
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortStats, SortError> {
        let input_file = fs::File::open(input).map_err(|err| SortError::io(Phase::Input, None, err))?;
        let input_len = input_file
            .metadata()
            .map_err(|err| SortError::io(Phase::Input, None, err))?
            .len();

        let trailing_bytes = input_len % self.format.width() as u64;
        if trailing_bytes != 0 && self.trailing_bytes == TrailingBytes::Reject {
            return Err(SortError::MalformedInput {
                trailing_bytes,
                record_width: self.format.width(),
            });
        }

        let output_dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut output_file = tempfile::Builder::new()
            .prefix(".sorting-")
            .tempfile_in(output_dir)
            .map_err(|err| SortError::io(Phase::Output, None, err))?;

        log::info!("sorting {} ({} bytes)", input.display(), input_len);

        let input_reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, input_file),
            None => io::BufReader::new(input_file),
        };
        let stats = self.sort(input_reader, &mut output_file)?;

        output_file
            .persist(output)
            .map_err(|err| SortError::io(Phase::Output, None, err.error))?;

        log::info!(
            "{} records sorted using {} run(s), result saved to {}",
            stats.records,
            stats.runs,
            output.display()
        );

        return Ok(stats);
    }

    /// Splits the input into sorted runs each holding no more records than the memory budget allows.
    /// If an error occurs all the runs created so far are removed.
    ///
    /// A stream length is unknown in advance, so a trailing partial record rejected by
    /// [`TrailingBytes::Reject`] is only detected once the preceding runs have been written.
    /// Those runs are removed before [`SortError::MalformedInput`] is returned.
    /// [`ExternalSorter::sort_file`] checks the file length before any run is written.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    pub fn partition<R: Read>(&self, input: R) -> Result<RunSet, SortError> {
        let mut records = RecordReader::with_trailing_bytes(input, self.format, self.trailing_bytes);
        let mut run_set = RunSet::new();
        let mut run_buf = self.buffer_builder.build();

        for record in records.by_ref() {
            run_buf.push(record.map_err(|err| SortError::io(Phase::Input, None, err))?);

            if run_buf.is_full() {
                self.check_cancelled()?;
                run_set.push(self.create_run(run_set.len(), run_buf)?);
                run_buf = self.buffer_builder.build();
            }
        }

        if !run_buf.is_empty() {
            self.check_cancelled()?;
            run_set.push(self.create_run(run_set.len(), run_buf)?);
        }
        run_set.set_truncated_bytes(records.truncated_bytes() as u64);

        log::debug!(
            "external sort preparation done ({} records, {} runs)",
            run_set.records(),
            run_set.len()
        );

        return Ok(run_set);
    }

    fn create_run(&self, id: usize, mut buffer: RunBuffer) -> Result<ExternalRun, SortError> {
        log::debug!("sorting run {} data ({} records) ...", id, buffer.len());
        self.thread_pool.install(|| {
            buffer.par_sort_unstable();
        });

        log::debug!("saving run {} data", id);
        let external_run = ExternalRun::build(self.tmp_dir.path(), id, buffer, self.format, self.rw_buf_size)
            .map_err(|err| SortError::io(Phase::Partition, Some(id), err))?;

        return Ok(external_run);
    }

    /// Merges the runs into a single sorted stream written to the output.
    /// Returns the number of records written.
    ///
    /// Run files are removed both on success and on failure, every run handle is closed
    /// before the merge returns. On failure the records already written to the output are left in place.
    ///
    /// # Arguments
    /// * `run_set` - Runs to be merged
    /// * `output` - Output stream sorted data to be written to
    pub fn merge<W: Write>(&self, run_set: RunSet, output: W) -> Result<u64, SortError> {
        log::debug!("merging {} runs ({} records) ...", run_set.len(), run_set.records());

        let readers = run_set
            .runs()
            .iter()
            .map(|run| {
                run.open(self.rw_buf_size)
                    .map_err(|err| SortError::io(Phase::Merge, Some(run.id()), err))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output_writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, output),
            None => io::BufWriter::new(output),
        };
        let mut output_writer = RecordWriter::new(output_writer, self.format);

        for record in BinaryHeapMerger::new(readers) {
            let record = record?;
            self.check_cancelled()?;
            output_writer
                .write_record(record)
                .map_err(|err| SortError::io(Phase::Output, None, err))?;
        }
        output_writer
            .flush()
            .map_err(|err| SortError::io(Phase::Output, None, err))?;

        let written = output_writer.written();
        run_set
            .close()
            .map_err(|err| SortError::io(Phase::Merge, None, err))?;

        log::debug!("external sort merging done ({} records)", written);

        return Ok(written);
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::{self, prelude::*};
    use std::path::Path;

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, Phase, SortConfig, SortError};
    use crate::cancel::CancellationToken;
    use crate::record::{
        ByteOrder, PartialRecord, RecordFormat, RecordReader, RecordWidth, RecordWriter, TrailingBytes,
    };
    use crate::verify::check_sorted;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn encode(values: &[i64], format: RecordFormat) -> Vec<u8> {
        let mut writer = RecordWriter::new(Vec::new(), format);
        for value in values {
            writer.write_record(*value).unwrap();
        }
        writer.into_inner()
    }

    fn decode(bytes: &[u8], format: RecordFormat) -> Vec<i64> {
        let reader = RecordReader::new(bytes, format);
        let values: Result<Vec<i64>, io::Error> = reader.collect();
        values.unwrap()
    }

    fn build_sorter(tmp_dir: &Path, records_per_run: u64) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_memory_budget(records_per_run * 4)
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir)
            .build()
            .unwrap()
    }

    fn files_count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[rstest]
    fn test_external_sorter(tmp_dir: tempfile::TempDir) {
        let input_sorted = Vec::from_iter(-50..50);

        let mut input_shuffled = input_sorted.clone();
        input_shuffled.shuffle(&mut rand::thread_rng());

        let sorter = build_sorter(tmp_dir.path(), 8);
        let input = encode(&input_shuffled, sorter.format());

        let mut output = Vec::new();
        let stats = sorter.sort(input.as_slice(), &mut output).unwrap();

        assert_eq!(stats.records, 100);
        assert_eq!(stats.runs, 13);
        assert_eq!(decode(&output, sorter.format()), input_sorted);
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[rstest]
    fn test_partition_and_merge(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 2);
        let input = encode(&[5, 3, 3, 1, 4], sorter.format());

        let run_set = sorter.partition(input.as_slice()).unwrap();
        assert_eq!(run_set.len(), 3);
        assert_eq!(run_set.records(), 5);
        assert_eq!(files_count(sorter.tmp_dir()), 3);

        let run_lens = Vec::from_iter(run_set.runs().iter().map(|run| run.len()));
        assert_eq!(run_lens, vec![2, 2, 1]);

        for run in run_set.runs() {
            let records: Result<Vec<i64>, _> = run.open(None).unwrap().collect();
            let records = records.unwrap();
            assert!(records.windows(2).all(|w| w[0] <= w[1]));
        }

        let mut output = Vec::new();
        let written = sorter.merge(run_set, &mut output).unwrap();

        assert_eq!(written, 5);
        assert_eq!(decode(&output, sorter.format()), vec![1, 3, 3, 4, 5]);
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 2);

        let run_set = sorter.partition(io::empty()).unwrap();
        assert!(run_set.is_empty());
        assert_eq!(files_count(sorter.tmp_dir()), 0);

        let mut output = Vec::new();
        let written = sorter.merge(run_set, &mut output).unwrap();
        assert_eq!(written, 0);
        assert!(output.is_empty());
    }

    #[rstest]
    #[case(5)]
    #[case(16)]
    fn test_single_run(tmp_dir: tempfile::TempDir, #[case] records_per_run: u64) {
        let sorter = build_sorter(tmp_dir.path(), records_per_run);
        let input = encode(&[2, -7, 2, 0, 9], sorter.format());

        let run_set = sorter.partition(input.as_slice()).unwrap();
        assert_eq!(run_set.len(), 1);

        let mut output = Vec::new();
        sorter.merge(run_set, &mut output).unwrap();
        assert_eq!(decode(&output, sorter.format()), vec![-7, 0, 2, 2, 9]);
    }

    #[rstest]
    fn test_sorted_input_unchanged(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 7);
        let values = Vec::from_iter((0..200).map(|v| v / 3 - 20));
        let input = encode(&values, sorter.format());

        let mut output = Vec::new();
        sorter.sort(input.as_slice(), &mut output).unwrap();
        assert_eq!(output, input);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(10)]
    #[case(64)]
    #[case(999)]
    #[case(5000)]
    fn test_batch_size_invariance(tmp_dir: tempfile::TempDir, #[case] records_per_run: u64) {
        let mut rng = rand::thread_rng();
        let values = Vec::from_iter((0..1000).map(|_| rng.gen_range(-100..100)));

        let mut expected = values.clone();
        expected.sort();

        let sorter = build_sorter(tmp_dir.path(), records_per_run);
        let input = encode(&values, sorter.format());

        let mut output = Vec::new();
        let stats = sorter.sort(input.as_slice(), &mut output).unwrap();

        let expected_runs = (1000 + records_per_run - 1) / records_per_run;
        assert_eq!(stats.runs as u64, expected_runs);
        assert_eq!(decode(&output, sorter.format()), expected);
    }

    #[rstest]
    #[case(RecordWidth::W1, ByteOrder::Little, -128..128)]
    #[case(RecordWidth::W2, ByteOrder::Big, -32768..32768)]
    #[case(RecordWidth::W8, ByteOrder::Native, i64::MIN..i64::MAX)]
    fn test_record_formats(
        tmp_dir: tempfile::TempDir,
        #[case] width: RecordWidth,
        #[case] byte_order: ByteOrder,
        #[case] range: std::ops::Range<i64>,
    ) {
        let format = RecordFormat::new(width, byte_order);
        let mut rng = rand::thread_rng();
        let values = Vec::from_iter((0..500).map(|_| rng.gen_range(range.clone())));

        let mut expected = values.clone();
        expected.sort();

        let sorter = ExternalSorterBuilder::new()
            .with_record_width(width)
            .with_byte_order(byte_order)
            .with_memory_budget(32 * width.bytes() as u64)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        sorter.sort(encode(&values, format).as_slice(), &mut output).unwrap();
        assert_eq!(decode(&output, format), expected);
    }

    #[rstest]
    fn test_million_records(tmp_dir: tempfile::TempDir) {
        let mut rng = rand::thread_rng();
        let values = Vec::from_iter((0..1_000_000).map(|_| rng.gen_range(0..=1_000_000)));

        let sorter = build_sorter(tmp_dir.path(), 10_000);
        let input = encode(&values, sorter.format());

        let run_set = sorter.partition(input.as_slice()).unwrap();
        assert_eq!(run_set.len(), 100);

        let mut output = Vec::new();
        let written = sorter.merge(run_set, &mut output).unwrap();
        assert_eq!(written, 1_000_000);

        let report = check_sorted(output.as_slice(), sorter.format()).unwrap();
        assert_eq!(report.records, 1_000_000);
        assert!(report.is_sorted());
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[rstest]
    fn test_malformed_input_rejected(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 2);
        let mut input = encode(&[5, 3, 3, 1, 4], sorter.format());
        input.extend_from_slice(&[1, 2]);

        let err = sorter.sort(input.as_slice(), io::sink()).unwrap_err();
        assert!(
            matches!(
                err,
                SortError::MalformedInput {
                    trailing_bytes: 2,
                    record_width: 4
                }
            ),
            "{}",
            err
        );
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[rstest]
    fn test_malformed_input_truncated(tmp_dir: tempfile::TempDir) {
        let sorter = ExternalSorterBuilder::new()
            .with_memory_budget(8)
            .with_trailing_bytes(TrailingBytes::Truncate)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();
        let mut input = encode(&[5, 3, 3, 1, 4], sorter.format());
        input.extend_from_slice(&[1, 2, 3]);

        let mut output = Vec::new();
        let stats = sorter.sort(input.as_slice(), &mut output).unwrap();

        assert_eq!(stats.truncated_bytes, 3);
        assert_eq!(decode(&output, sorter.format()), vec![1, 3, 3, 4, 5]);
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    fn test_memory_budget_too_small(tmp_dir: tempfile::TempDir, #[case] memory_budget: u64) {
        let result = ExternalSorterBuilder::new()
            .with_memory_budget(memory_budget)
            .with_tmp_dir(tmp_dir.path())
            .build();

        let err = result.err().unwrap();
        assert!(matches!(err, SortError::MemoryBudget { .. }), "{}", err);
        assert!(err.is_config_error());
    }

    #[rstest]
    fn test_tmp_dir_missing(tmp_dir: tempfile::TempDir) {
        let result = ExternalSorterBuilder::new()
            .with_tmp_dir(&tmp_dir.path().join("missing"))
            .build();

        let err = result.err().unwrap();
        assert!(matches!(err, SortError::TempDir(_)), "{}", err);
        assert!(err.is_config_error());
    }

    #[rstest]
    fn test_cancelled(tmp_dir: tempfile::TempDir) {
        let token = CancellationToken::new();
        let sorter = ExternalSorterBuilder::new()
            .with_memory_budget(8)
            .with_tmp_dir(tmp_dir.path())
            .with_cancellation_token(token.clone())
            .build()
            .unwrap();
        let input = encode(&[5, 3, 3, 1, 4], sorter.format());

        let run_set = sorter.partition(input.as_slice()).unwrap();
        token.cancel();

        let err = sorter.merge(run_set, io::sink()).unwrap_err();
        assert!(matches!(err, SortError::Cancelled), "{}", err);
        assert_eq!(files_count(sorter.tmp_dir()), 0);

        let err = sorter.partition(input.as_slice()).unwrap_err();
        assert!(matches!(err, SortError::Cancelled), "{}", err);
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[rstest]
    fn test_corrupted_run(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 2);
        let input = encode(&[5, 3, 3, 1, 4], sorter.format());

        let run_set = sorter.partition(input.as_slice()).unwrap();
        let corrupted = &run_set.runs()[1];
        fs::OpenOptions::new()
            .write(true)
            .open(corrupted.path())
            .unwrap()
            .set_len(6)
            .unwrap();

        let err = sorter.merge(run_set, io::sink()).unwrap_err();
        assert!(
            matches!(
                err,
                SortError::IO {
                    phase: Phase::Merge,
                    run: Some(1),
                    ..
                }
            ),
            "{}",
            err
        );
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[test]
    fn test_partial_record_phase() {
        let partial = || {
            io::Error::new(
                io::ErrorKind::InvalidData,
                PartialRecord {
                    bytes: 2,
                    record_width: 4,
                },
            )
        };

        let err = SortError::io(Phase::Input, None, partial());
        assert!(matches!(err, SortError::MalformedInput { trailing_bytes: 2, .. }), "{}", err);

        let err = SortError::io(Phase::Merge, Some(3), partial());
        assert!(
            matches!(
                err,
                SortError::IO {
                    phase: Phase::Merge,
                    run: Some(3),
                    ..
                }
            ),
            "{}",
            err
        );
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "test error"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[rstest]
    fn test_output_failure(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 2);
        let input = encode(&Vec::from_iter(0..10_000), sorter.format());

        let err = sorter.sort(input.as_slice(), FailingWriter).unwrap_err();
        assert_eq!(err.to_string(), "I/O operation failed during output writing: test error");
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[rstest]
    fn test_sort_file(tmp_dir: tempfile::TempDir) {
        let format = RecordFormat::default();
        let input_path = tmp_dir.path().join("input.bin");
        let output_path = tmp_dir.path().join("output.bin");
        fs::write(&input_path, encode(&[5, 3, 3, 1, 4], format)).unwrap();

        let scratch = tmp_dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();

        let config = SortConfig {
            memory_budget: 8,
            tmp_dir: Some(scratch.clone()),
            ..SortConfig::default()
        };
        let stats = crate::sort_file(config, &input_path, &output_path).unwrap();

        assert_eq!(stats.records, 5);
        assert_eq!(stats.runs, 3);
        assert_eq!(decode(&fs::read(&output_path).unwrap(), format), vec![1, 3, 3, 4, 5]);
        assert_eq!(fs::read(&input_path).unwrap(), encode(&[5, 3, 3, 1, 4], format));
        assert_eq!(files_count(&scratch), 0);
        assert_eq!(files_count(tmp_dir.path()), 3);
    }

    #[rstest]
    fn test_sort_file_malformed(tmp_dir: tempfile::TempDir) {
        let input_path = tmp_dir.path().join("input.bin");
        let output_path = tmp_dir.path().join("output.bin");
        fs::write(&input_path, vec![0u8; 10]).unwrap();

        let sorter = build_sorter(tmp_dir.path(), 2);
        let err = sorter.sort_file(&input_path, &output_path).unwrap_err();

        assert!(matches!(err, SortError::MalformedInput { trailing_bytes: 2, .. }), "{}", err);
        assert!(!output_path.exists());
        assert_eq!(files_count(sorter.tmp_dir()), 0);
    }

    #[rstest]
    fn test_sort_file_missing_input(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 2);
        let err = sorter
            .sort_file(&tmp_dir.path().join("missing.bin"), &tmp_dir.path().join("output.bin"))
            .unwrap_err();

        assert!(err.to_string().starts_with("I/O operation failed during input reading"), "{}", err);
    }
}
