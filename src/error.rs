//! Error taxonomy shared by every subsystem of the proxy.

use std::fmt;
use std::io;

/// Result of proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Allocation or resource exhaustion; always propagated.
    NoMem,
    /// Light node or directory entry absent.
    NotFound,
    /// Expected a directory and got a non-directory.
    NotDir,
    /// The caller specified a directory in a non-directory operation.
    IsDir,
    /// Underlying file could not be opened.
    BadPort,
    /// Symlink chain exceeded the limit, or a lookup redirected back
    /// to the proxy root.
    Loop,
    /// Open or owner check failed.
    Permission,
    /// Translator shutdown blocked; the caller may retry with the
    /// force flag.
    Busy,
    /// Mutation RPC invoked on the proxy.
    Unsupported,
    /// A name exceeded the host limit.
    NameTooLong,
    /// Pass-through of an error code produced by the underlying
    /// filesystem or by translator startup.
    Underlying(i32),
}

impl Error {
    /// Raw errno carried by [`Error::Underlying`], if any.
    pub fn raw_os_error(self) -> Option<i32> {
        match self {
            Error::Underlying(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMem => write!(f, "out of memory"),
            Error::NotFound => write!(f, "no such file or directory"),
            Error::NotDir => write!(f, "not a directory"),
            Error::IsDir => write!(f, "is a directory"),
            Error::BadPort => write!(f, "underlying file could not be opened"),
            Error::Loop => write!(f, "too many levels of indirection"),
            Error::Permission => write!(f, "permission denied"),
            Error::Busy => write!(f, "translator is busy"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::NameTooLong => write!(f, "name too long"),
            Error::Underlying(code) => {
                write!(f, "underlying filesystem error ({})", code)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            NotFound => Error::NotFound,
            PermissionDenied => Error::Permission,
            InvalidInput | InvalidData => Error::BadPort,
            OutOfMemory => Error::NoMem,
            _ => match err.raw_os_error() {
                Some(code) if code == libc::ENOTDIR => Error::NotDir,
                Some(code) if code == libc::EISDIR => Error::IsDir,
                Some(code) if code == libc::ELOOP => Error::Loop,
                Some(code) if code == libc::ENAMETOOLONG => Error::NameTooLong,
                Some(code) => Error::Underlying(code),
                None => Error::BadPort,
            },
        }
    }
}
