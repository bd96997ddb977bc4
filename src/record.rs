//! Fixed-width integer records and their binary encoding.
//!
//! A record is a signed integer stored in `1`, `2`, `4` or `8` bytes using a configured byte order.
//! Records are held in memory as [`i64`] regardless of their width, so that every width shares
//! the same sorting, merging and verification code.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io::{self, prelude::*};

/// Largest supported record width in bytes.
pub const MAX_RECORD_WIDTH: usize = 8;

/// Number of bytes a single record occupies on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordWidth {
    W1,
    W2,
    #[default]
    W4,
    W8,
}

impl RecordWidth {
    /// Returns the width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            RecordWidth::W1 => 1,
            RecordWidth::W2 => 2,
            RecordWidth::W4 => 4,
            RecordWidth::W8 => 8,
        }
    }

    /// Converts a byte count to a record width. Returns [`None`] for unsupported widths.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(RecordWidth::W1),
            2 => Some(RecordWidth::W2),
            4 => Some(RecordWidth::W4),
            8 => Some(RecordWidth::W8),
            _ => None,
        }
    }
}

/// Byte order used to (de)serialize records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    Little,
    Big,
    #[default]
    Native,
}

/// What to do with bytes at the end of an input that do not form a complete record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailingBytes {
    /// Fail with a malformed input error.
    #[default]
    Reject,
    /// Drop the incomplete record and log a warning.
    Truncate,
}

/// Error raised when an input ends in the middle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialRecord {
    /// Number of bytes of the incomplete record.
    pub bytes: usize,
    /// Expected record width.
    pub record_width: usize,
}

impl Display for PartialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input ends with {} byte(s) that do not form a complete {}-byte record",
            self.bytes, self.record_width
        )
    }
}

impl Error for PartialRecord {}

impl PartialRecord {
    /// Extracts a partial record error wrapped into an [`io::Error`].
    pub fn from_io_error(err: &io::Error) -> Option<PartialRecord> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<PartialRecord>())
            .copied()
    }
}

macro_rules! decode_as {
    ($ty:ty, $order:expr, $buf:expr) => {{
        let mut bytes = [0u8; std::mem::size_of::<$ty>()];
        bytes.copy_from_slice($buf);
        match $order {
            ByteOrder::Little => <$ty>::from_le_bytes(bytes) as i64,
            ByteOrder::Big => <$ty>::from_be_bytes(bytes) as i64,
            ByteOrder::Native => <$ty>::from_ne_bytes(bytes) as i64,
        }
    }};
}

macro_rules! encode_as {
    ($ty:ty, $order:expr, $value:expr, $buf:expr) => {{
        let value = <$ty>::try_from($value).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("value {} does not fit into a {}-byte record", $value, std::mem::size_of::<$ty>()),
            )
        })?;
        let bytes = match $order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Native => value.to_ne_bytes(),
        };
        $buf.copy_from_slice(&bytes);
    }};
}

/// Binary layout of a record: its width and byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFormat {
    pub width: RecordWidth,
    pub byte_order: ByteOrder,
}

impl RecordFormat {
    pub fn new(width: RecordWidth, byte_order: ByteOrder) -> Self {
        RecordFormat { width, byte_order }
    }

    /// Returns the record width in bytes.
    pub fn width(&self) -> usize {
        self.width.bytes()
    }

    /// Decodes a record. `buf` length must be equal to the record width.
    pub fn decode(&self, buf: &[u8]) -> i64 {
        match self.width {
            RecordWidth::W1 => decode_as!(i8, self.byte_order, buf),
            RecordWidth::W2 => decode_as!(i16, self.byte_order, buf),
            RecordWidth::W4 => decode_as!(i32, self.byte_order, buf),
            RecordWidth::W8 => decode_as!(i64, self.byte_order, buf),
        }
    }

    /// Encodes a record into `buf` which length must be equal to the record width.
    /// Fails if the value is out of the record width range.
    pub fn encode(&self, value: i64, buf: &mut [u8]) -> io::Result<()> {
        match self.width {
            RecordWidth::W1 => encode_as!(i8, self.byte_order, value, buf),
            RecordWidth::W2 => encode_as!(i16, self.byte_order, value, buf),
            RecordWidth::W4 => encode_as!(i32, self.byte_order, value, buf),
            RecordWidth::W8 => encode_as!(i64, self.byte_order, value, buf),
        }

        return Ok(());
    }
}

/// Sequential record reader.
pub struct RecordReader<R: Read> {
    reader: R,
    format: RecordFormat,
    trailing_bytes: TrailingBytes,
    truncated_bytes: usize,
    buf: [u8; MAX_RECORD_WIDTH],
}

impl<R: Read> RecordReader<R> {
    /// Creates a reader rejecting a trailing partial record.
    pub fn new(reader: R, format: RecordFormat) -> Self {
        Self::with_trailing_bytes(reader, format, TrailingBytes::Reject)
    }

    pub fn with_trailing_bytes(reader: R, format: RecordFormat, trailing_bytes: TrailingBytes) -> Self {
        RecordReader {
            reader,
            format,
            trailing_bytes,
            truncated_bytes: 0,
            buf: [0; MAX_RECORD_WIDTH],
        }
    }

    /// Number of trailing bytes dropped by the [`TrailingBytes::Truncate`] policy.
    pub fn truncated_bytes(&self) -> usize {
        self.truncated_bytes
    }

    /// Reads the next record. Returns [`None`] when the underlying reader is exhausted.
    pub fn read_record(&mut self) -> io::Result<Option<i64>> {
        let width = self.format.width();
        let buf = &mut self.buf[..width];

        let mut filled = 0;
        while filled < width {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        if filled == width {
            return Ok(Some(self.format.decode(buf)));
        }
        if filled == 0 {
            return Ok(None);
        }

        match self.trailing_bytes {
            TrailingBytes::Reject => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                PartialRecord {
                    bytes: filled,
                    record_width: width,
                },
            )),
            TrailingBytes::Truncate => {
                log::warn!("dropping {} trailing byte(s) of an incomplete record", filled);
                self.truncated_bytes += filled;
                Ok(None)
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = io::Result<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

/// Sequential record writer.
pub struct RecordWriter<W: Write> {
    writer: W,
    format: RecordFormat,
    written: u64,
    buf: [u8; MAX_RECORD_WIDTH],
}

impl<W: Write> RecordWriter<W> {
    pub fn new(writer: W, format: RecordFormat) -> Self {
        RecordWriter {
            writer,
            format,
            written: 0,
            buf: [0; MAX_RECORD_WIDTH],
        }
    }

    /// Writes a single record.
    pub fn write_record(&mut self, value: i64) -> io::Result<()> {
        let buf = &mut self.buf[..self.format.width()];
        self.format.encode(value, buf)?;
        self.writer.write_all(buf)?;
        self.written += 1;

        return Ok(());
    }

    /// Number of records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
