use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Invalid configuration, rejected synchronously at call time.
    Config(String),
    /// Bookkeeping or concurrency invariant violated; not retryable.
    InvalidState(String),
    /// An expected file (commit, table, write-ahead) is missing.
    NotFound(String),
    /// On-disk data doesn't parse: bad checksum, bad size, bad framing.
    Corrupt(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Corrupt(msg) => write!(f, "Corrupt data: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
