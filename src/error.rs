//! Error types for the reactor core and its socket layer.

use std::{error, fmt, io, result};

/// A convenience wrapper around `Result` for [`enum@Error`].
pub type Result<T> = result::Result<T, Error>;

/// Set of errors that can occur while running the reactor.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Error raised by a socket, epoll, eventfd, or timerfd operation.
    Io(io::Error),
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref err) => fmt::Display::fmt(err, f),
        }
    }
}
