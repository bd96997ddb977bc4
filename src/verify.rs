//! Streaming sort order verification.

use std::io::{self, prelude::*};

use crate::record::{RecordFormat, RecordReader};

/// Two adjacent records in descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inversion {
    /// Position of the second record of the pair.
    pub position: u64,
    pub previous: i64,
    pub current: i64,
}

/// Verification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyReport {
    /// Number of records read.
    pub records: u64,
    /// The first pair of records out of order, if any.
    pub first_inversion: Option<Inversion>,
}

impl VerifyReport {
    pub fn is_sorted(&self) -> bool {
        self.first_inversion.is_none()
    }
}

/// Checks that the records of the stream are in ascending order comparing adjacent pairs,
/// so the stream is never loaded into memory. The whole stream is read to count its records.
/// A trailing partial record is reported as an error.
pub fn check_sorted<R: Read>(input: R, format: RecordFormat) -> io::Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let mut previous: Option<i64> = None;

    for record in RecordReader::new(input, format) {
        let record = record?;
        if let Some(previous) = previous {
            if record < previous && report.first_inversion.is_none() {
                report.first_inversion = Some(Inversion {
                    position: report.records,
                    previous,
                    current: record,
                });
            }
        }
        previous = Some(record);
        report.records += 1;
    }

    return Ok(report);
}
