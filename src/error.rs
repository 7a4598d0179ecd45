use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the library boundary.
///
/// Entries of an archive are independent: an error while extracting one
/// entry never invalidates its siblings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cipher key is {got} bytes, level {level} requires {want}")]
    InvalidKeySize { level: usize, got: usize, want: usize },

    #[error("bad archive magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("unsupported archive version: {0}")]
    InvalidVersion(u32),

    #[error("checksum mismatch: computed 0x{computed:08X}, stored 0x{stored:08X}")]
    InvalidChecksum { computed: u32, stored: u32 },

    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: u64, available: u64 },

    #[error("{what} out of range: {value} (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: u64,
        limit: u64,
    },

    #[error("malformed token stream: {0}")]
    MalformedTokenStream(String),

    #[error("unsupported entry type: {0}")]
    UnsupportedType(u32),

    #[error("unsupported configuration: {0}")]
    Unsupported(&'static str),

    #[error("path error: {0}")]
    Path(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps a typed error so it can travel through an `io::Read`
    /// implementation and still display its own message.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}
