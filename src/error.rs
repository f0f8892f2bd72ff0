use std::fmt::Display;

/// Silt errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The key does not exist. This is the normal miss outcome of reads and
    /// never surfaces from the write path.
    NotFound,
    /// Persistent data failed validation: bad framing, checksum mismatch, or
    /// an impossible internal value.
    Corruption(String),
    /// The caller passed something the engine cannot act on.
    InvalidArgument(String),
    /// An error from the underlying storage.
    Io(String),
    /// The operation is not supported by this build or configuration.
    NotSupported(String),
    /// The database has been closed. Takes precedence over other failures
    /// once close has begun.
    Closed,
    /// The snapshot was released before the operation that used it.
    SnapshotReleased,
    /// The iterator was released before the operation that used it.
    IterReleased,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::Closed => write!(f, "database closed"),
            Error::SnapshotReleased => write!(f, "snapshot released"),
            Error::IterReleased => write!(f, "iterator released"),
        }
    }
}

/// Constructs an Error::Corruption from a format string.
#[macro_export]
macro_rules! corrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// A silt Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::NotFound.to_string(), "not found");
        assert_eq!(
            Error::Corruption("bad checksum".into()).to_string(),
            "corruption: bad checksum"
        );
        assert_eq!(Error::Closed.to_string(), "database closed");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "device gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(msg) if msg.contains("device gone")));
    }
}
