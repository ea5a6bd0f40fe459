//! Non-blocking connection establishment.
//!
//! The state machine starts a dial on the native handle, then alternates
//! readiness waits on the connection's socket adapter with calls to the
//! handle's poll step until the handshake finishes or fails:
//!
//! ```text
//! Init -> Started -> (WriteWait | ReadWait)* -> Done
//!                                          \-> Failed
//! ```

use std::time::Instant;

use crate::connection::{Connectiable, Connection, Statistics};
use crate::error::{Error, Result};
use crate::native::{ConnStatus, Dialer, NativeHandle, PollingStatus};
use crate::reactor::Completion;
use crate::socket::SocketAdapter;

/// Handle type a connectiable's connection holds.
pub type HandleOf<C> = <<C as Connectiable>::Target as Connection>::Handle;

/// Position of a dial in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectState {
    Init,
    Started,
    WriteWait,
    ReadWait,
    Done,
    Failed,
}

struct Machine<'a, C: Connection> {
    conn: &'a mut C,
    state: ConnectState,
    stats: Statistics,
}

impl<'a, C: Connection> Machine<'a, C> {
    fn new(conn: &'a mut C) -> Self {
        Self {
            conn,
            state: ConnectState::Init,
            stats: Statistics::default(),
        }
    }

    fn transition(&mut self, next: ConnectState) {
        tracing::trace!(from = ?self.state, to = ?next, "connect state");
        self.state = next;
    }

    async fn run<D>(&mut self, dialer: &D, conninfo: &str) -> Result<()>
    where
        D: Dialer<Handle = C::Handle>,
    {
        let handle = dialer
            .connect_start(conninfo)
            .ok_or(Error::ConnectionStartFailed)?;
        let status = handle.status();
        // The adapter may still hold the previous session's descriptor.
        self.conn.socket_mut().close();
        *self.conn.native_handle_mut() = Some(handle);
        self.transition(ConnectState::Started);

        if status == ConnStatus::Bad {
            return Err(Error::ConnectionStatusBad {
                message: self.native_error(),
                conninfo: conninfo.to_string(),
            });
        }

        let fd = self
            .conn
            .native_handle()
            .and_then(|h| h.socket())
            .ok_or(Error::SocketUnavailable)?
            .try_clone_to_owned()?;
        self.conn.socket_mut().assign(fd)?;

        let mut wait = ConnectState::WriteWait;
        loop {
            self.transition(wait);
            let ready = if wait == ConnectState::WriteWait {
                self.stats.write_waits += 1;
                self.conn.socket_mut().writable().await
            } else {
                self.stats.read_waits += 1;
                self.conn.socket_mut().readable().await
            };
            ready.map_err(Error::Polling)?;

            self.stats.polls += 1;
            let handle = self
                .conn
                .native_handle_mut()
                .as_mut()
                .ok_or(Error::SocketUnavailable)?;
            match handle.connect_poll() {
                PollingStatus::Ok => return Ok(()),
                PollingStatus::Writing => wait = ConnectState::WriteWait,
                PollingStatus::Reading => wait = ConnectState::ReadWait,
                PollingStatus::Failed => return Err(Error::PollFailed(self.native_error())),
            }
        }
    }

    fn native_error(&self) -> String {
        self.conn
            .native_handle()
            .and_then(|h| h.error_message())
            .map(|m| m.trim_end().to_string())
            .unwrap_or_default()
    }
}

/// Establish a session on `conn`.
///
/// On failure the connection keeps whatever handle the dial produced, so
/// [`Connectiable::is_bad`] and [`Connectiable::error_message`] describe
/// it. `conninfo` appears verbatim in [`Error::ConnectionStatusBad`]; callers
/// holding credentials can swap it with [`Error::with_conninfo`].
pub async fn connect<C, D>(conn: &mut C, dialer: &D, conninfo: &str) -> Result<()>
where
    C: Connectiable,
    D: Dialer<Handle = HandleOf<C>>,
{
    let conn = conn.connection_mut().ok_or(Error::NoConnection)?;
    let started = Instant::now();

    let mut machine = Machine::new(conn);
    let result = machine.run(dialer, conninfo).await;
    machine.transition(if result.is_ok() {
        ConnectState::Done
    } else {
        ConnectState::Failed
    });

    let mut stats = std::mem::take(&mut machine.stats);
    stats.connect_time = started.elapsed();
    match &result {
        Ok(()) => tracing::debug!(
            polls = stats.polls,
            elapsed_ms = stats.connect_time.as_millis() as u64,
            "connection established"
        ),
        Err(e) => tracing::debug!(error = %e, polls = stats.polls, "connection attempt failed"),
    }
    if let Some(slot) = machine.conn.statistics_mut() {
        *slot = stats;
    }

    result
}

/// Run [`connect`] as a task on the connection's reactor and deliver the
/// connection, or the error, to `completion`.
///
/// The completion runs exactly once, through its executor, and never before
/// this function returns.
pub fn async_connect<C, D, F>(
    mut conn: C,
    dialer: D,
    conninfo: impl Into<String>,
    completion: Completion<F>,
) where
    C: Connectiable,
    D: Dialer<Handle = HandleOf<C>>,
    F: FnOnce(Result<C>) + Send + 'static,
{
    let Some(reactor) = conn.reactor().cloned() else {
        completion.complete(Err(Error::NoConnection));
        return;
    };
    let conninfo = conninfo.into();
    reactor.spawn(async move {
        let result = connect(&mut conn, &dialer, &conninfo).await.map(|()| conn);
        completion.complete(result);
    });
}
