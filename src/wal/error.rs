//! Error types for the write-ahead event log.

use crate::calc::SequenceId;
use std::fmt;
use std::path::PathBuf;

/// Failure modes of the append-only event log.
///
/// `QueueFull` is retryable back-pressure; everything below it is
/// infrastructure or determinism failure and is fatal to the process —
/// no best-effort continuation that could desynchronise the log from
/// in-memory state.
#[derive(Debug)]
#[non_exhaustive]
pub enum WalError {
    /// An I/O error occurred while reading or writing log files.
    Io {
        /// The underlying I/O error message.
        message: String,
        /// The file path involved, if known.
        path: Option<PathBuf>,
    },

    /// The group-commit queue is full; the caller must retry or shed
    /// load. Nothing was written.
    QueueFull,

    /// A record failed CRC32 verification.
    CorruptRecord {
        /// The sequence number of the corrupt record.
        sequence: SequenceId,
        /// The CRC32 stored alongside the record.
        expected_crc: u32,
        /// The CRC32 computed from the record bytes.
        actual_crc: u32,
    },

    /// A record at or below the committed high-water mark is unreadable.
    /// The process must refuse to start.
    CorruptBelowCommitted {
        /// The committed high-water mark.
        committed: SequenceId,
        /// The last sequence that could be read back.
        last_readable: SequenceId,
    },

    /// A record header is truncated or malformed.
    InvalidRecord {
        /// Byte offset within the segment where the error occurred.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// A record payload did not decode to a known event shape.
    MalformedPayload {
        /// The sequence number of the undecodable record.
        sequence: SequenceId,
        /// Description of the problem.
        message: String,
    },

    /// The requested sequence is not present in the log.
    SequenceNotFound {
        /// The sequence number that was requested.
        sequence: SequenceId,
    },

    /// Replay observed non-contiguous sequences. Determinism violation;
    /// fatal.
    SequenceGap {
        /// The sequence expected next.
        expected: SequenceId,
        /// The sequence actually read.
        actual: SequenceId,
    },

    /// A single record is larger than a whole segment.
    RecordTooLarge {
        /// The size of the encoded record in bytes.
        record_bytes: usize,
        /// The maximum segment size in bytes.
        segment_size: usize,
    },

    /// A snapshot file failed its checksum or version validation.
    SnapshotInvalid {
        /// Description of the problem.
        message: String,
    },

    /// An internal mutex was poisoned (another thread panicked while
    /// holding the lock).
    MutexPoisoned,
}

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalError::Io { message, path } => {
                write!(f, "event-log I/O failure")?;
                if let Some(p) = path {
                    write!(f, " touching {}", p.display())?;
                }
                write!(f, ": {message}")
            }
            WalError::QueueFull => write!(f, "wal group-commit queue full"),
            WalError::CorruptRecord {
                sequence,
                expected_crc,
                actual_crc,
            } => {
                write!(
                    f,
                    "record {sequence} failed its CRC32 check (stored {expected_crc:08x}, \
                     recomputed {actual_crc:08x})"
                )
            }
            WalError::CorruptBelowCommitted {
                committed,
                last_readable,
            } => {
                write!(
                    f,
                    "wal unreadable below committed high-water mark: \
                     committed {committed}, last readable {last_readable}"
                )
            }
            WalError::InvalidRecord { offset, message } => {
                write!(f, "unreadable record framing at byte offset {offset}: {message}")
            }
            WalError::MalformedPayload { sequence, message } => {
                write!(f, "malformed wal payload at sequence {sequence}: {message}")
            }
            WalError::SequenceNotFound { sequence } => {
                write!(f, "no record carries sequence {sequence}")
            }
            WalError::SequenceGap { expected, actual } => {
                write!(f, "sequence gap in wal: expected {expected}, got {actual}")
            }
            WalError::RecordTooLarge {
                record_bytes,
                segment_size,
            } => {
                write!(
                    f,
                    "a {record_bytes}-byte record cannot fit a {segment_size}-byte segment"
                )
            }
            WalError::SnapshotInvalid { message } => {
                write!(f, "invalid snapshot: {message}")
            }
            WalError::MutexPoisoned => {
                write!(f, "writer state unusable after a panic while its lock was held")
            }
        }
    }
}

impl std::error::Error for WalError {}

impl WalError {
    /// Whether the caller may retry (back-pressure) rather than abort.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::QueueFull)
    }
}
