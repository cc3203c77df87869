//! Fatal load-time errors.
//!
//! Structural violations in an MZ header or an OMF record stream abort the
//! whole load: every later index would be meaningless. Each variant names
//! the violated field or record. Recoverable analysis problems never use
//! this type; they become [`crate::diag::Diagnostic`] values instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    // MZ executables
    #[error("not an MZ executable: signature {0:#06X}")]
    BadSignature(u16),
    #[error("MZ header truncated: {0} bytes, need at least 28")]
    HeaderTruncated(usize),
    #[error("MZ PageCount is zero")]
    ZeroPageCount,
    #[error("MZ declared file size {declared} exceeds stream length {actual}")]
    FileSizeOverrun { declared: usize, actual: usize },
    #[error("MZ HeaderSize {0} bytes out of range [28, file size]")]
    BadHeaderSize(usize),
    #[error("MZ relocation table [{start:#X}, {end:#X}) not contained in [28, header size)")]
    BadRelocTable { start: usize, end: usize },
    #[error("image already relocated")]
    AlreadyRelocated,

    // OMF object modules / libraries
    #[error("OMF record truncated at byte offset {0}")]
    RecordTruncated(usize),
    #[error("OMF record {kind:#04X} malformed: {reason}")]
    MalformedRecord { kind: u8, reason: String },
    #[error("OMF {table} index {index} out of range")]
    IndexOutOfRange { table: &'static str, index: usize },
    #[error("FIXUPP record has no preceding LEDATA/LIDATA record")]
    OrphanFixupp,
    #[error("library header declares invalid page size {0}")]
    BadPageSize(usize),
    #[error("unexpected end of library file")]
    UnexpectedEof,
    #[error("file is neither an MZ executable nor an OMF object or library")]
    UnknownFormat,

    #[error(transparent)]
    Decode(#[from] crate::dec::DecodeError),
}

impl LoadError {
    pub(crate) fn malformed(kind: u8, reason: impl Into<String>) -> Self {
        LoadError::MalformedRecord { kind, reason: reason.into() }
    }
}
