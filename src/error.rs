use std::io;

/// The error type used in this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The input violates the perf.data layout.
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// The input file could not be opened or mapped.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A subprocess could not be spawned.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// An invariant was violated at runtime.
    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),
}

/// This error indicates that the input bytes do not form a valid
/// perf.data version 2 file.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Did not recognize magic value {0:?}")]
    UnrecognizedMagicValue([u8; 8]),

    #[error("Read crossed the end of a byte region")]
    UnexpectedEof,

    #[error("A file section pointed outside of the mapped file")]
    SectionOutOfBounds,

    #[error("Could not read perf_event_header")]
    RecordHeader,

    #[error("The record size in a perf_event_header was smaller than the header itself")]
    InvalidRecordSize,

    #[error("Advancing by the record size went past the end of the data section")]
    MisalignedRecord,

    #[error("Could not read the record payload")]
    RecordPayload,

    #[error("Could not read perf_event_attr")]
    EventAttr,

    #[error("Could not read the HEADER_EVENT_DESC section")]
    EventDescSection,

    #[error("The sample layout is missing the required IP and PERIOD fields")]
    MissingSampleFields,
}

/// A subprocess could not be started. A tool that starts and exits
/// non-zero, or produces no output, is not an error.
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("Failed to spawn `{command}`: {error}")]
    Spawn { command: String, error: io::Error },
}

/// A violated invariant detected while aggregating samples.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    #[error("Sample refers to event id {0:#x} which is not in the descriptor table")]
    UnknownEventId(u64),
}
