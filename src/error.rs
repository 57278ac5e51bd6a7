//! Error handling helpers and primitives.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
/// The error kinds surfaced by the daemon. Callers match on the kind to
/// distinguish recoverable conditions (`NotFound`, `WrongState`) from real
/// failures.
pub enum Error {
    /// A requested object, key or attribute does not exist. Layers that read
    /// keys which may legitimately be absent return this so callers can treat
    /// absence as a non-error.
    #[error("not found: {0}")]
    NotFound(String),

    /// A configuration file or value could not be parsed.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The udev event or device handle was missing required information.
    #[error("udev: {0}")]
    Udev(String),

    /// An I/O operation on sysfs or the store failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The `unique_id` below an opened sysfs directory does not match the
    /// device it was opened for.
    #[error("unique_id mismatch: expected '{expected}', read '{actual}'")]
    IdentityMismatch { expected: String, actual: String },

    /// An operation was requested in a state that does not allow it.
    #[error("wrong device state: {0}")]
    WrongState(String),

    /// Generic failure with a descriptive message.
    #[error("{0}")]
    Failed(String),
}

impl Error {
    /// Wrap an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: io::Error) -> Error {
        if source.kind() == io::ErrorKind::NotFound {
            return Error::NotFound(context.into());
        }
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a `nix` error with context, classifying `ENOENT` as `NotFound`.
    pub fn from_nix<S: Into<String>>(context: S, err: nix::Error) -> Error {
        let source = match err.as_errno() {
            Some(errno) => io::Error::from_raw_os_error(errno as i32),
            None => io::Error::new(io::ErrorKind::Other, err.to_string()),
        };
        Error::io(context, source)
    }

    /// True iff the error represents a missing object or key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True iff the error came from a state machine precondition.
    pub fn is_wrong_state(&self) -> bool {
        matches!(self, Error::WrongState(_))
    }
}

/// Chain creates a string from an error stack.
pub fn chain(res: anyhow::Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}
