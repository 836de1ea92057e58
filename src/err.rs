use core::fmt::{self, Display, Formatter};

/// `CanFail` is a return type for functions that are allowed to fail, and don't need to return
/// anything.
pub type CanFail<T> = Result<(), T>;

/// `AllocError` defines the error types raised when setting up an allocator over a segment.
///
/// Requests that fail at steady state (out of memory, oversized or zero-length requests) are
/// reported through a null [`HeapAddr`](crate::mem::HeapAddr) instead, so that the allocation
/// fast path never builds an error value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The segment is too small to hold the index sentinel and one minimum-size block.
    SegmentTooSmall,

    /// The segment bounds are not 8-byte aligned.
    BadAlignment,
}

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentTooSmall => write!(f, "segment too small for this allocator"),
            Self::BadAlignment => write!(f, "segment bounds are not 8-byte aligned"),
        }
    }
}

impl std::error::Error for AllocError {}

/// `SegmentError` defines the error types raised when mapping or unmapping the backing byte
/// region of an allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentError {
    /// `mmap` refused the request.
    MapFailed,

    /// A zero-length segment was requested.
    EmptySegment,
}

impl Display for SegmentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapFailed => write!(f, "failed to map the backing segment"),
            Self::EmptySegment => write!(f, "cannot map an empty segment"),
        }
    }
}

impl std::error::Error for SegmentError {}

/// `ScriptError` is raised by the script parser when a line of a test script cannot be turned
/// into an allocator operation.
///
/// It carries the 1-based line number so a failing script can be fixed by hand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptError {
    pub line: usize,
    pub kind: ScriptErrorKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptErrorKind {
    /// The line does not start with one of the `a` / `r` / `f` opcodes.
    UnknownOp(String),

    /// An id or size field is missing or is not a number.
    BadField(String),

    /// Trailing garbage after a well-formed operation.
    TrailingInput,
}

impl Display for ScriptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ScriptErrorKind::UnknownOp(op) => {
                write!(f, "line {}: unknown operation {:?}", self.line, op)
            }
            ScriptErrorKind::BadField(field) => {
                write!(f, "line {}: malformed field {:?}", self.line, field)
            }
            ScriptErrorKind::TrailingInput => {
                write!(f, "line {}: trailing input after operation", self.line)
            }
        }
    }
}

impl std::error::Error for ScriptError {}
