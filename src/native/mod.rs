//! Native protocol handles.
//!
//! A native handle owns one backend session and advances its handshake in
//! non-blocking steps, in the manner of libpq's `PQconnectStart` and
//! `PQconnectPoll`. The connect state machine only sees handles through
//! [`NativeHandle`] and [`Dialer`]; [`WireHandle`] is the implementation
//! shipped with the crate.

pub mod auth;
pub mod config;
pub mod protocol;
pub mod wire;

use std::os::fd::BorrowedFd;

pub use config::PgConfig;
pub use wire::{WireDialer, WireHandle};

/// Session status as reported by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnStatus {
    /// Waiting for the transport connection to be made.
    Started,
    /// Transport is up, startup packet not yet sent.
    Made,
    /// Waiting for the server to answer the startup or a password.
    AwaitingResponse,
    /// Authenticated, waiting for the backend to become ready.
    AuthOk,
    /// Ready for queries.
    Ok,
    Bad,
}

/// Outcome of one non-blocking handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Handshake complete.
    Ok,
    /// Call again once the socket is writable.
    Writing,
    /// Call again once the socket is readable.
    Reading,
    Failed,
}

/// Exclusive owner of one backend session.
///
/// Dropping the handle finalizes the session.
pub trait NativeHandle: Send + 'static {
    fn status(&self) -> ConnStatus;

    /// Last error reported by the session, if any. May end with a newline.
    fn error_message(&self) -> Option<&str>;

    /// Descriptor the session reads and writes, `None` when there is none.
    fn socket(&self) -> Option<BorrowedFd<'_>>;

    /// Advance the handshake as far as possible without blocking.
    fn connect_poll(&mut self) -> PollingStatus;
}

/// Starts sessions from a connection string.
pub trait Dialer: Clone + Send + Sync + 'static {
    type Handle: NativeHandle;

    /// Begin a non-blocking connection attempt.
    ///
    /// `None` means no handle could be allocated at all. Problems with the
    /// connection string or the target are reported through a handle whose
    /// status is [`ConnStatus::Bad`].
    fn connect_start(&self, conninfo: &str) -> Option<Self::Handle>;
}
