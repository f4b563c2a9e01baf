use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::volume::FsType;

/// Classification of a patch script problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Unexpected, but the script can still be applied.
    Warning,
    /// The script is malformed and must not be applied.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("WARNING"),
            Severity::Error => f.write_str("ERROR"),
        }
    }
}

/// A problem found while parsing a patch script.
///
/// Keeps the whole originating buffer so the rendered message can quote the
/// offending line.
#[derive(Debug, Clone)]
pub struct FormatError {
    pub offset: usize,
    pub buffer: Arc<[u8]>,
    pub severity: Severity,
    pub message: String,
}

impl FormatError {
    pub fn new(buffer: &Arc<[u8]>, offset: usize, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            offset,
            buffer: Arc::clone(buffer),
            severity,
            message: message.into(),
        }
    }

    /// The full line of the script containing `offset`.
    pub fn line_text(&self) -> String {
        let start = self.offset.min(self.buffer.len());
        let line_start = self.buffer[..start]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |p| p + 1);
        let line_end = self.buffer[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.buffer.len(), |p| start + p);
        String::from_utf8_lossy(&self.buffer[line_start..line_end]).into_owned()
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: at offset {}: {}\n  in {}",
            self.severity,
            self.offset,
            self.message,
            self.line_text()
        )
    }
}

impl std::error::Error for FormatError {}

/// Errors raised by the diff/apply engine.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("input image does not exist: {0}")]
    InputMissing(PathBuf),

    #[error("output image already exists: {0}")]
    OutputExists(PathBuf),

    #[error("an output path is required when producing a differencing disk")]
    MissingOutput,

    #[error("disk is not partitioned: {0}")]
    NotPartitioned(PathBuf),

    #[error("input disks do not have the same number of partitions ({old} vs {new}); select a partition pair explicitly")]
    PartitionCountMismatch { old: usize, new: usize },

    #[error("partition {index} does not exist (disk has {count})")]
    PartitionOutOfRange { index: usize, count: usize },

    #[error("filesystem of partition {new_index} ({new:?}) does not match filesystem of partition {old_index} ({old:?})")]
    FsTypeMismatch {
        old_index: usize,
        old: FsType,
        new_index: usize,
        new: FsType,
    },

    #[error("patch format error: {0}")]
    Format(#[from] FormatError),

    #[error("context check failed for hunk {hunk}: {reason}")]
    ContextMismatch { hunk: String, reason: String },

    #[error("registry hive error: {0}")]
    Hive(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{count} entries failed, first: {first}")]
    EntryFailures { count: usize, first: Box<EntryFailure> },

    #[error("background task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiffError>;

/// One queue or registry entry that could not be processed.
#[derive(Debug, thiserror::Error)]
#[error("{path}: {error}")]
pub struct EntryFailure {
    pub path: String,
    #[source]
    pub error: DiffError,
}

/// Turn collected per-entry failures into a single error.
pub fn ensure_no_failures(failures: Vec<EntryFailure>) -> Result<()> {
    let count = failures.len();
    match failures.into_iter().next() {
        None => Ok(()),
        Some(first) => Err(DiffError::EntryFailures {
            count,
            first: Box::new(first),
        }),
    }
}
