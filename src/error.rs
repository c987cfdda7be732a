//! Crate-wide error types.

use thiserror::Error;

/// The error type for interactions with this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A `umem`/`udict`/`ubuf` allocation failed.
    #[error("allocation failed")]
    Alloc,
    /// A bitstream failed to parse.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// The input flow definition did not start with the expected prefix.
    #[error("unexpected flow definition (expected prefix {expected:?})")]
    FlowDef {
        /// The prefix this pipe requires on its input flow definition.
        expected: &'static str,
    },
    /// A `set()` would need a length field wider than 16 bits to encode.
    #[error("attribute value too large to encode (max {} bytes)", u16::MAX)]
    Overflow,
}

/// Failures specific to parsing an MPEG-2 video elementary stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid frame rate code {0}")]
    FrameRate(u8),
    #[error("invalid aspect ratio code {0}")]
    Aspect(u8),
    #[error("invalid chroma format {0}")]
    Chroma(u8),
    #[error("invalid profile/level {0:#x}")]
    ProfileLevel(u8),
    #[error("unexpected header extension id {0}")]
    Extension(u8),
}

/// The crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
