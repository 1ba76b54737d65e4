use std::fmt;
use std::io;

/// Errors raised while setting a connection up. These are returned to the
/// caller synchronously; once a connection is live, failures are surfaced
/// through events instead.
#[derive(Debug)]
pub enum SetupError {
    /// The address string could not be understood.
    BadAddress(String),
    /// Name resolution produced no usable address.
    Resolve(String),
    /// The OS refused the socket/bind/listen/connect call.
    Socket(io::Error),
    /// The TLS provider rejected the configuration.
    Tls(String),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SetupError::BadAddress(addr) => write!(f, "malformed address: {}", addr),
            SetupError::Resolve(host) => write!(f, "no address found for host: {}", host),
            SetupError::Socket(err) => write!(f, "socket setup failed: {}", err),
            SetupError::Tls(msg) => write!(f, "tls setup failed: {}", msg),
        }
    }
}

impl std::error::Error for SetupError {}

impl From<io::Error> for SetupError {
    fn from(err: io::Error) -> Self {
        SetupError::Socket(err)
    }
}

pub type SetupResult<T> = Result<T, SetupError>;

/// Classification of a fatal runtime failure on a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    Io(io::ErrorKind),
    Tls,
    Protocol(&'static str),
    Exhausted,
}

/// Two-level runtime result: `Wait` means the operation cannot make progress
/// until the socket is ready again, `Fatal` means the connection is beyond
/// recovery and must be closed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Err(NetworkError::Fatal(_)) => true,
            _ => false,
        }
    }
}
