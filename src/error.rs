//! Error types for connection establishment and pooling.
//!
//! Every failure of a connect attempt or a checkout is delivered through the
//! same completion channel as success; nothing here is retried internally.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The dialer could not allocate a native handle.
    #[error("failed to allocate a new connection handle")]
    ConnectionStartFailed,

    /// The native handle reported no open descriptor after a successful start.
    #[error("no server connection is currently open, handle has no socket")]
    SocketUnavailable,

    /// The native handle reported a bad status right after the dial started.
    #[error("{}", bad_status_message(.message, .conninfo))]
    ConnectionStatusBad { message: String, conninfo: String },

    /// The non-blocking poll step reported failure.
    #[error("connection poll failed: {0}")]
    PollFailed(String),

    /// A readiness wait itself delivered an error.
    #[error("error during connection polling: {0}")]
    Polling(#[source] io::Error),

    /// Descriptor duplication or reactor registration failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A connection wrapper was asked for its connection but holds none.
    #[error("connection wrapper holds no connection")]
    NoConnection,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("timed out while establishing a connection")]
    Timeout,

    /// The completion was dropped without being invoked.
    #[error("operation was canceled before completion")]
    Canceled,

    #[error("invalid connection string: {0}")]
    Config(String),
}

impl Error {
    /// Replace the dial string carried by a bad-status error.
    ///
    /// The connect state machine treats the dial string opaquely; callers that
    /// hold credentials in it swap in a redacted form before the error leaves
    /// their hands.
    pub fn with_conninfo(self, display: &str) -> Self {
        match self {
            Error::ConnectionStatusBad { message, .. } => Error::ConnectionStatusBad {
                message,
                conninfo: display.to_string(),
            },
            other => other,
        }
    }

    /// True for errors that terminate a single connect attempt.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionStartFailed
                | Error::SocketUnavailable
                | Error::ConnectionStatusBad { .. }
                | Error::PollFailed(_)
                | Error::Polling(_)
                | Error::Io(_)
        )
    }
}

fn bad_status_message(message: &str, conninfo: &str) -> String {
    if message.is_empty() {
        format!("connection is bad ({})", conninfo)
    } else {
        format!("connection is bad: {} ({})", message, conninfo)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
