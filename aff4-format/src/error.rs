use crate::urn::Urn;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No handler found for object. URN: '{0}'")]
    NotFound(Urn),

    #[error("Object '{urn}' is a {actual}, not a {expected}")]
    TypeMismatch {
        urn: Urn,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Required attribute '{attr}' is missing. URN: '{urn}'")]
    MissingAttribute { urn: Urn, attr: &'static str },

    #[error("Malformed volume (the archive structure is invalid): {0}")]
    Structural(String),

    #[error("URN '{0}' is already held by this thread; opening it again would deadlock")]
    ConcurrencyHazard(Urn),

    #[error("Timed out waiting for the lock on '{0}'")]
    LockTimeout(Urn),

    #[error("Cancelled while waiting for the lock on '{0}'")]
    Cancelled(Urn),

    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn structural<S: Into<String>>(msg: S) -> Error {
        Error::Structural(msg.into())
    }

    pub(crate) fn crypto<S: Into<String>>(msg: S) -> Error {
        Error::Crypto(msg.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            Error::Structural(_) => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            Error::LockTimeout(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, err),
            Error::Cancelled(_) => std::io::Error::new(std::io::ErrorKind::Interrupted, err),
            other => std::io::Error::other(other),
        }
    }
}
