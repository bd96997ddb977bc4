//! Sorted runs stored on file system.

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use tempfile;

use crate::record::{PartialRecord, RecordFormat, RecordReader, RecordWriter};
use crate::sort::{Phase, SortError};

/// A sorted sequence of records persisted to a uniquely named temporary file.
/// The file is removed when the run is closed or dropped.
#[derive(Debug)]
pub struct ExternalRun {
    id: usize,
    path: tempfile::TempPath,
    len: u64,
    format: RecordFormat,
}

impl ExternalRun {
    /// Writes `records` to a new temporary file created in `dir`.
    /// Records are persisted in the given order, the caller is responsible for sorting them.
    ///
    /// # Arguments
    /// * `dir` - Directory the run file is created in
    /// * `id` - Run identifier, used as a merge tie-break and in diagnostics
    /// * `records` - Records to be saved
    /// * `format` - Records binary layout
    /// * `buf_size` - Write buffer size
    pub fn build(
        dir: &Path,
        id: usize,
        records: impl IntoIterator<Item = i64>,
        format: RecordFormat,
        buf_size: Option<usize>,
    ) -> io::Result<Self> {
        let tmp_file = tempfile::Builder::new()
            .prefix("run-")
            .suffix(".bin")
            .tempfile_in(dir)?;

        let run_writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, tmp_file),
            None => io::BufWriter::new(tmp_file),
        };

        let mut run_writer = RecordWriter::new(run_writer, format);
        for record in records.into_iter() {
            run_writer.write_record(record)?;
        }
        run_writer.flush()?;

        let len = run_writer.written();
        let tmp_file = run_writer.into_inner().into_inner().map_err(|err| err.into_error())?;

        log::debug!("run {} saved to {} ({} records)", id, tmp_file.path().display(), len);

        return Ok(ExternalRun {
            id,
            path: tmp_file.into_temp_path(),
            len,
            format,
        });
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of records in the run.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a forward-only reader over the run records.
    pub fn open(&self, buf_size: Option<usize>) -> io::Result<RunReader> {
        let file = fs::File::open(&self.path)?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };
        let byte_len = self.len * self.format.width() as u64;

        return Ok(RunReader {
            run_id: self.id,
            remaining: self.len,
            records: RecordReader::new(reader.take(byte_len), self.format),
            last: None,
        });
    }

    /// Deletes the run file.
    pub fn close(self) -> io::Result<()> {
        self.path.close()
    }
}

/// Forward-only run reader. Owns the run file handle which is released when the reader is dropped.
pub struct RunReader {
    run_id: usize,
    remaining: u64,
    records: RecordReader<io::Take<io::BufReader<fs::File>>>,
    last: Option<i64>,
}

impl RunReader {
    pub fn run_id(&self) -> usize {
        self.run_id
    }

    fn read_next(&mut self) -> io::Result<i64> {
        let record = self.records.read_record().map_err(|err| match PartialRecord::from_io_error(&err) {
            Some(partial) => io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("run file ends in the middle of a record ({} byte(s) left)", partial.bytes),
            ),
            None => err,
        })?;
        let record = record.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} record(s) missing", self.remaining),
            )
        })?;

        if cfg!(debug_assertions) {
            if let Some(last) = self.last {
                if record < last {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("run is not sorted: {} follows {}", record, last),
                    ));
                }
            }
            self.last = Some(record);
        }

        self.remaining -= 1;
        return Ok(record);
    }
}

impl Iterator for RunReader {
    type Item = Result<i64, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            None
        } else {
            match self.read_next() {
                Ok(record) => Some(Ok(record)),
                Err(err) => {
                    self.remaining = 0;
                    Some(Err(SortError::io(Phase::Merge, Some(self.run_id), err)))
                }
            }
        }
    }
}

/// Collection of all runs produced from a single input.
/// Dropping the set removes every run file it still owns.
#[derive(Default, Debug)]
pub struct RunSet {
    runs: Vec<ExternalRun>,
    records: u64,
    truncated_bytes: u64,
}

impl RunSet {
    pub fn new() -> Self {
        RunSet::default()
    }

    /// Adds a run to the set.
    pub fn push(&mut self, run: ExternalRun) {
        self.records += run.len();
        self.runs.push(run);
    }

    /// Number of runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total number of records in all runs.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of input trailing bytes dropped while the set was produced.
    pub fn truncated_bytes(&self) -> u64 {
        self.truncated_bytes
    }

    pub(crate) fn set_truncated_bytes(&mut self, truncated_bytes: u64) {
        self.truncated_bytes = truncated_bytes;
    }

    pub fn runs(&self) -> &[ExternalRun] {
        &self.runs
    }

    /// Deletes every run file reporting the first failure.
    pub fn close(self) -> io::Result<()> {
        let mut result = Ok(());
        for run in self.runs {
            let run_id = run.id();
            if let Err(err) = run.close() {
                log::warn!("run {} file removal failed: {}", run_id, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        return result;
    }
}
