use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Domain errors delivered on asynchronous completions.
///
/// User code branches on the variant; where a syscall or TLS library
/// produced the failure the raw error rides along (shared, so the same
/// error can fan out to every continuation of a dying handle) and is
/// reachable through [`Error::system`].
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("name resolution failed")]
    Resolve,
    #[error("operation already in progress")]
    Already,
    #[error("configuration rejected: {0}")]
    InvalidConfiguration(&'static str),

    #[error("datagram socket shut down")]
    DatagramShutdown,
    #[error("datagram system error: {0}")]
    DatagramSystem(Arc<io::Error>),

    #[error("stream system error: {0}")]
    StreamSystem(Arc<io::Error>),
    #[error("stream socket error: {0}")]
    StreamSocket(Arc<io::Error>),
    #[error("stream shut down")]
    StreamShutdown,

    #[error("timer canceled")]
    TimerCancel,

    #[error("listener system error: {0}")]
    ListenerSystem(Arc<io::Error>),

    #[error("secure context failure")]
    SecureContext,
    #[error("secure socket failure")]
    SecureSocket,
    #[error("secure accept failed")]
    SecureAccept,
    #[error("secure connect failed")]
    SecureConnect,
    #[error("secure shutdown failed")]
    SecureShutdown,

    #[error("connection killed")]
    ConnectionKilled,
    #[error("connection inactivity timeout")]
    ConnectionInactivityTimeout,
    #[error("too many keepalive packets received")]
    ConnectionTooManyKeepalive,
    #[error("invalid ack count received")]
    ConnectionAckCount,
    #[error("connection in invalid state")]
    ConnectionInvalidState,
    #[error("invalid response state")]
    ConnectionInvalidResponseState,
    #[error("too many receive buffers in use")]
    ConnectionTooManyRecvBuffers,

    #[error("message canceled")]
    MessageCanceled,
    #[error("message canceled by peer")]
    MessageCanceledPeer,
    #[error("message lost its connection")]
    MessageConnection,
}

impl Error {
    pub fn stream_system(err: io::Error) -> Error {
        Error::StreamSystem(Arc::new(err))
    }

    pub fn stream_socket(err: io::Error) -> Error {
        Error::StreamSocket(Arc::new(err))
    }

    pub fn datagram_system(err: io::Error) -> Error {
        Error::DatagramSystem(Arc::new(err))
    }

    pub fn listener_system(err: io::Error) -> Error {
        Error::ListenerSystem(Arc::new(err))
    }

    /// The captured OS error, when this condition was produced by a
    /// failing syscall. Kept separate from the taxonomy so diagnostics
    /// can log errno while callers branch on the variant.
    pub fn system(&self) -> Option<&io::Error> {
        match self {
            Error::DatagramSystem(e)
            | Error::StreamSystem(e)
            | Error::StreamSocket(e)
            | Error::ListenerSystem(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
