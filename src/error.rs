
//! Error type definitions.

use std::borrow::Cow;
use std::io::ErrorKind;
use std::convert::TryFrom;

/// A result that, if ok, contains nothing, and otherwise contains a pixio error.
pub type UnitResult = Result<()>;

/// A result that may contain a pixio error.
pub type Result<T> = std::result::Result<T, Error>;

/// A raw `std::io` result, for the byte-level helpers that
/// have not yet decided which error category a failure falls into.
pub type IoResult<T> = std::io::Result<T>;

/// An error that may happen while reading or writing an image file.
/// Distinguishes structural header problems from per-chunk data corruption,
/// so that a single damaged chunk does not have to abort a whole file.
#[derive(Debug)]
pub enum Error {

    /// A fixed header field is structurally invalid:
    /// bad magic bytes, inverted bounds, an unsupported bit depth
    /// or compression code. Fatal to opening the file.
    MalformedHeader(Cow<'static, str>),

    /// The pixel payload of one chunk disagrees with its declared size,
    /// or a run-length stream stopped short of or ran past the expected
    /// output length. Fatal only to the read call that hit the chunk;
    /// other chunks of the same file may still be readable.
    CorruptData(Cow<'static, str>),

    /// A requested chunk was never written, typically because the
    /// writing process was interrupted. Callers may keep reading the
    /// chunks that do exist.
    IncompleteFile(Cow<'static, str>),

    /// The frame buffer declares a pixel type that has no defined
    /// conversion from or to the file's channel type.
    TypeMismatch(Cow<'static, str>),

    /// The file is valid, but a feature it uses is not supported
    /// by this implementation.
    NotSupported(Cow<'static, str>),

    /// The underlying byte stream failed, for example
    /// because a file could not be opened or the disk is full.
    Io(std::io::Error),
}

impl Error {

    /// Create an error describing a structurally invalid header field.
    pub(crate) fn malformed(message: impl Into<Cow<'static, str>>) -> Self {
        Error::MalformedHeader(message.into())
    }

    /// Create an error describing corrupt chunk contents.
    pub(crate) fn corrupt(message: impl Into<Cow<'static, str>>) -> Self {
        Error::CorruptData(message.into())
    }

    /// Create an error describing a chunk that was never written.
    pub(crate) fn incomplete(message: impl Into<Cow<'static, str>>) -> Self {
        Error::IncompleteFile(message.into())
    }

    /// Create an error describing an undefined pixel type conversion.
    pub(crate) fn type_mismatch(message: impl Into<Cow<'static, str>>) -> Self {
        Error::TypeMismatch(message.into())
    }

    /// Create an error describing a valid but unsupported feature.
    pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Error::NotSupported(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == ErrorKind::UnexpectedEof {
            Error::corrupt("reference to missing bytes")
        }
        else {
            Error::Io(error)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MalformedHeader(message) => write!(formatter, "malformed header: {}", message),
            Error::CorruptData(message) => write!(formatter, "corrupt data: {}", message),
            Error::IncompleteFile(message) => write!(formatter, "incomplete file: {}", message),
            Error::TypeMismatch(message) => write!(formatter, "type mismatch: {}", message),
            Error::NotSupported(message) => write!(formatter, "not supported: {}", message),
            Error::Io(error) => write!(formatter, "io error: {}", error),
        }
    }
}


/// Narrow a signed file integer to `usize`, treating negative values as corrupt data.
#[inline]
pub(crate) fn i32_to_usize(value: i32, error_message: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::corrupt(error_message))
}

/// Narrow an unsigned 64-bit file integer to `usize`.
/// Only fails on 32-bit machines, where a file may declare more bytes than addressable.
#[inline]
pub(crate) fn u64_to_usize(value: u64, error_message: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::corrupt(error_message))
}

/// Widen a `usize` into a signed 32-bit file integer, failing for huge images.
#[inline]
pub(crate) fn usize_to_i32(value: usize, error_message: &'static str) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::unsupported(error_message))
}

/// Widen a `usize` into an unsigned 16-bit file integer, failing for huge images.
#[inline]
pub(crate) fn usize_to_u16(value: usize, error_message: &'static str) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::unsupported(error_message))
}

/// Widen a `usize` into an unsigned 32-bit file integer, failing for huge images.
#[inline]
pub(crate) fn usize_to_u32(value: usize, error_message: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::unsupported(error_message))
}
