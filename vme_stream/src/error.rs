/*!
Error types for the readout stream library.

Runtime input problems (loss, corrupt frames, oversized sections) are never
errors at this level: they are counted and recovered from inside the parsers.
What remains here are configuration errors, detected once before a run starts,
and the cursor's end-of-buffer condition.
*/

use thiserror::Error;

use crate::engine::BufferFormat;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, StreamError>;

/// A read or skip would have passed the end of the buffer.
///
/// Callers treat this as "need more data": processing of the current buffer
/// stops but the parse state stays valid.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("end of buffer: {wanted} bytes requested at offset {offset}, {available} available")]
pub struct EndOfBuffer {
    pub offset: usize,
    pub wanted: usize,
    pub available: usize,
}

/// Problems with a single module's readout command list
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleProgramError {
    #[error("multiple block reads in module readout")]
    MultipleBlockReads,

    #[error("block read after suffix in module readout")]
    BlockReadAfterSuffix,

    #[error("{segment} of {len} words exceeds the 255 word limit")]
    SegmentTooLong { segment: &'static str, len: usize },
}

/// Readout layout errors, all fatal to starting a run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadoutInfoError {
    #[error("event {event}, module {module}: {source}")]
    Module {
        event: usize,
        module: usize,
        source: ModuleProgramError,
    },

    #[error("{count} events configured, at most {max} are supported")]
    TooManyEvents { count: usize, max: usize },

    #[error("event {event}, module {module}: module type id {type_id} exceeds {max}")]
    ModuleTypeOutOfRange {
        event: usize,
        module: usize,
        type_id: u8,
        max: u8,
    },

    #[error("event {event}: stack id {stack_id} exceeds {max}")]
    StackIdOutOfRange { event: usize, stack_id: u8, max: u8 },

    #[error("stack id {stack_id} is used by events {first} and {second}")]
    DuplicateStackId {
        stack_id: u8,
        first: usize,
        second: usize,
    },
}

/// Comprehensive error type for library operations
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    EndOfBuffer(#[from] EndOfBuffer),

    /// Readout layout could not be built
    #[error("Readout configuration error: {0}")]
    ReadoutInfo(#[from] ReadoutInfoError),

    /// Malformed event or module section while reading output buffers
    #[error("Invalid section: {0}")]
    InvalidSection(String),

    /// Engine configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A raw buffer of a different controller family than the run's
    #[error("buffer {buffer_number}: {found} data fed to a {expected} engine")]
    FormatMismatch {
        buffer_number: u32,
        found: BufferFormat,
        expected: BufferFormat,
    },
}

impl StreamError {
    /// Create a new invalid section error
    pub fn invalid_section(msg: impl Into<String>) -> Self {
        Self::InvalidSection(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
