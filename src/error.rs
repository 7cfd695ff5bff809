use std::fmt;
use std::io;
use thiserror::Error;

/// Failure categories delivered to handlers through [`crate::Event::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketError {
    FailedCreate,
    FailedBind,
    FailedListen,
    /// Connect or accept failed.
    FailedStart,
    FailedRead,
    FailedWrite,
    FailedClose,
    FailedPoll,
    /// The OS flagged the socket itself with an error condition.
    Poll,
    BufferOverflow,
}

impl SocketError {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketError::FailedCreate => "failed to create socket",
            SocketError::FailedBind => "failed to bind socket",
            SocketError::FailedListen => "failed to listen on socket",
            SocketError::FailedStart => "failed to start connection",
            SocketError::FailedRead => "failed to read from socket",
            SocketError::FailedWrite => "failed to write to socket",
            SocketError::FailedClose => "failed to close socket",
            SocketError::FailedPoll => "failed to poll socket",
            SocketError::Poll => "socket error reported by poll",
            SocketError::BufferOverflow => "read buffer overflow",
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{kind}: {source}")]
    Socket {
        kind: SocketError,
        #[source]
        source: io::Error,
    },

    #[error("Aborted by handler during {0}")]
    Aborted(&'static str),

    #[error("Invalid socket state: {0}")]
    InvalidState(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn socket(kind: SocketError, source: io::Error) -> Self {
        Error::Socket { kind, source }
    }

    /// The handler-facing category, if this error came from a socket operation.
    pub fn kind(&self) -> Option<SocketError> {
        match self {
            Error::Socket { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
