//! Error types for the emitter. None of these ever reach the hot path:
//! `try_emit` reports `Dropped` and counts instead.

use std::io;
use thiserror::Error;

/// Rejected configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ring_capacity must be a non-zero power of two, got {0}")]
    RingCapacity(usize),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("max_batch ({max_batch}) cannot exceed ring_capacity ({ring_capacity})")]
    BatchExceedsRing {
        max_batch: usize,
        ring_capacity: usize,
    },

    #[error("max_record_size ({record}) does not fit in a pool item ({item} bytes)")]
    RecordExceedsItem { record: usize, item: usize },

    #[error("pool_initial_items ({initial}) exceeds pool_max_items ({max})")]
    PoolBounds { initial: usize, max: usize },

    #[error("shutdown_grace must be under 10s, got {0:?}")]
    GraceTooLong(std::time::Duration),

    #[error("reading config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("parsing config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors raised while wiring up or tearing down an emitter.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn flusher thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("flusher thread panicked")]
    FlusherPanicked,

    #[error("ring reader already taken")]
    ReaderTaken,
}

/// Failure of one bulk write to the downstream sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink write timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("sink rejected batch: {0}")]
    Rejected(String),

    #[error("sink io error: {0}")]
    Io(#[from] io::Error),

    #[error("sink panicked: {0}")]
    Panicked(String),
}

impl SinkError {
    /// Map an io error to `Timeout` when the OS reports an expired deadline.
    pub fn from_io(err: io::Error, timeout: std::time::Duration) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SinkError::Timeout(timeout),
            _ => SinkError::Io(err),
        }
    }
}

/// Encoding an event into a fixed-size record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("record needs {needed} bytes but only {available} are available")]
    TooLarge { needed: usize, available: usize },

    #[error("field name longer than 255 bytes")]
    FieldName,

    #[error("string longer than 65535 bytes")]
    StringTooLong,

    #[error("too many fields")]
    TooManyFields,
}

/// A record read back from a sink could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record truncated at offset {0}")]
    Truncated(usize),

    #[error("unsupported record version {0}")]
    Version(u16),

    #[error("unknown event kind {0}")]
    Kind(u16),

    #[error("unknown field tag {0}")]
    Tag(u8),

    #[error("invalid utf-8 in record")]
    Utf8,

    #[error("length prefix {declared} does not match record size {actual}")]
    Length { declared: usize, actual: usize },
}
