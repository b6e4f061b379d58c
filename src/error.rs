//! Ambient error type.
//!
//! `linkerd-tcp` threads `std::io::Error` through `Router`/`Balancer`/
//! `Connection` rather than reaching for a dedicated error-handling crate;
//! this crate follows the same idiom and adds one small enum for the error
//! kinds spec.md §7 calls out that don't map onto an `io::ErrorKind`
//! (configuration errors, `EHOSTDOWN`, the max-connection limit).

use std::error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Unparsable configuration; the caller should abort with this
    /// diagnostic (spec.md §7, "Configuration").
    Config(String),
    /// No healthy destination is available (`-EHOSTDOWN`).
    HostDown,
    /// `router.conns` is already at `max_conn` (`-EMFILE`).
    MaxConn,
    Io(io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Error {
        Error::Config(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Config(ref s) => write!(f, "configuration error: {}", s),
            Error::HostDown => write!(f, "no healthy destination available (EHOSTDOWN)"),
            Error::MaxConn => write!(f, "connection limit reached (EMFILE)"),
            Error::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::Config(ref s) => s,
            Error::HostDown => "EHOSTDOWN",
            Error::MaxConn => "EMFILE",
            Error::Io(ref e) => error::Error::description(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            Error::HostDown => io::Error::new(io::ErrorKind::NotConnected, "EHOSTDOWN"),
            Error::MaxConn => io::Error::new(io::ErrorKind::Other, "EMFILE"),
            Error::Config(s) => io::Error::new(io::ErrorKind::InvalidInput, s),
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_down_round_trips_through_io_error() {
        let io_err: io::Error = Error::HostDown.into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn max_conn_displays_emfile() {
        assert_eq!(Error::MaxConn.to_string(), "connection limit reached (EMFILE)");
    }

    #[test]
    fn io_error_wraps_and_unwraps() {
        let orig = io::Error::new(io::ErrorKind::BrokenPipe, "boom");
        let wrapped: Error = orig.into();
        match wrapped {
            Error::Io(ref e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            _ => panic!("expected Error::Io"),
        }
        let back: io::Error = wrapped.into();
        assert_eq!(back.kind(), io::ErrorKind::BrokenPipe);
    }
}
