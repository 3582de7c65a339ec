//! Error type.

use std::{fmt, io};

use crate::{buffer::Ownership, uvc::RequestErrorCode};

/// UVC gadget error.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The event source is already registered with the multiplexer.
    DuplicateSource,
    /// The handle cannot be polled for readiness.
    InvalidDescriptor,
    /// The video source could not be opened or started.
    SourceUnavailable(String),
    /// The video source failed while producing frames.
    SourceError(String),
    /// A control request conflicts with the current stream state.
    InvalidStateForControl,
    /// Streaming was requested without a successful commit.
    NotCommitted,
    /// The addressed control or request is not implemented.
    UnsupportedControl,
    /// No UVC function matches the specifier.
    FunctionNotFound(String),
    /// Buffer memory could not be allocated.
    OutOfBuffers,
    /// A buffer was handed to a party that does not currently own it.
    Ownership {
        /// Buffer index.
        index: usize,
        /// Current holder.
        owner: Ownership,
        /// Holder required for the operation.
        expected: Ownership,
    },
    /// The function node failed during a streaming session.
    Node(io::Error),
    /// Other I/O error.
    Io(io::Error),
}

impl Error {
    /// Whether this error ended a streaming session only.
    ///
    /// The caller may keep serving the host and start a new session.
    pub fn is_session(&self) -> bool {
        matches!(self, Self::SourceError(_) | Self::SourceUnavailable(_) | Self::Node(_) | Self::OutOfBuffers)
    }

    /// Error code reported to the host through the request error code control
    /// after a control request has been stalled.
    pub fn request_error_code(&self) -> RequestErrorCode {
        match self {
            Self::InvalidStateForControl | Self::NotCommitted => RequestErrorCode::WrongState,
            Self::UnsupportedControl => RequestErrorCode::InvalidControl,
            Self::Io(err) if err.kind() == io::ErrorKind::InvalidData => RequestErrorCode::InvalidValue,
            _ => RequestErrorCode::Unknown,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DuplicateSource => write!(f, "event source is already registered"),
            Self::InvalidDescriptor => write!(f, "event source cannot be polled"),
            Self::SourceUnavailable(msg) => write!(f, "video source unavailable: {msg}"),
            Self::SourceError(msg) => write!(f, "video source failed: {msg}"),
            Self::InvalidStateForControl => write!(f, "control request invalid in current stream state"),
            Self::NotCommitted => write!(f, "streaming parameters have not been committed"),
            Self::UnsupportedControl => write!(f, "unsupported control request"),
            Self::FunctionNotFound(spec) => write!(f, "UVC function {spec} not found"),
            Self::OutOfBuffers => write!(f, "cannot allocate video buffers"),
            Self::Ownership { index, owner, expected } => {
                write!(f, "buffer {index} is held by {owner}, expected {expected}")
            }
            Self::Node(err) => write!(f, "UVC function node failed: {err}"),
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Node(err) | Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(err: rustix::io::Errno) -> Self {
        Self::Io(err.into())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) | Error::Node(err) => err,
            Error::FunctionNotFound(_) => io::Error::new(io::ErrorKind::NotFound, err),
            Error::OutOfBuffers => io::Error::new(io::ErrorKind::OutOfMemory, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Result type.
pub type Result<T> = std::result::Result<T, Error>;
