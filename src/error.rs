use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    InvalidMagic,
    ChecksumMismatch,
    Corrupted(String),
    BlobTooLarge { size: usize, max: usize },
    InvalidInput(String),
    MutexPoisoned,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::InvalidMagic => write!(f, "Invalid magic number"),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::Corrupted(msg) => write!(f, "Corrupted cache file: {}", msg),
            Error::BlobTooLarge { size, max } => {
                write!(f, "Blob of {} bytes exceeds maximum of {} bytes", size, max)
            }
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// True for errors that mean on-disk bytes are inconsistent, as opposed
    /// to the underlying device failing. Chain walks degrade these to a
    /// cache miss instead of surfacing them.
    pub(crate) fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::InvalidHeader
                | Error::InvalidMagic
                | Error::ChecksumMismatch
                | Error::Corrupted(_)
        )
    }
}
