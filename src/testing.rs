//! Scripted native handles and sockets for unit tests.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{Connection, PgConnection};
use crate::native::{ConnStatus, Dialer, NativeHandle, PollingStatus};
use crate::reactor::Reactor;
use crate::socket::SocketAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    WriteWait,
    ReadWait,
    Poll,
    Finish,
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub type MockConnection = PgConnection<MockHandle, MockSocket>;

/// What the next dial produces.
#[derive(Debug, Clone)]
pub struct Plan {
    pub fail_start: bool,
    pub status: ConnStatus,
    pub error: String,
    pub with_socket: bool,
    /// Results of successive polls; `Failed` once exhausted
    pub script: Vec<PollingStatus>,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            fail_start: false,
            status: ConnStatus::Started,
            error: String::new(),
            with_socket: true,
            script: vec![PollingStatus::Ok],
        }
    }
}

impl Plan {
    pub fn script(script: impl IntoIterator<Item = PollingStatus>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

pub struct MockHandle {
    status: ConnStatus,
    error: Option<String>,
    fd: Option<OwnedFd>,
    // Keeps the pair alive so the descriptor stays valid
    _peer: Option<UnixStream>,
    script: VecDeque<PollingStatus>,
    events: EventLog,
}

impl MockHandle {
    pub fn new(plan: &Plan, events: EventLog) -> Self {
        let (fd, peer) = if plan.with_socket {
            let (local, peer) = UnixStream::pair().expect("socket pair");
            (Some(OwnedFd::from(local)), Some(peer))
        } else {
            (None, None)
        };
        Self {
            status: plan.status,
            error: (!plan.error.is_empty()).then(|| plan.error.clone()),
            fd,
            _peer: peer,
            script: plan.script.iter().copied().collect(),
            events,
        }
    }

    pub fn events(&self) -> EventLog {
        Arc::clone(&self.events)
    }

    pub fn set_status(&mut self, status: ConnStatus) {
        self.status = status;
    }
}

impl NativeHandle for MockHandle {
    fn status(&self) -> ConnStatus {
        self.status
    }

    fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn socket(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn connect_poll(&mut self) -> PollingStatus {
        self.events.lock().push(Event::Poll);
        let result = self.script.pop_front().unwrap_or(PollingStatus::Failed);
        match result {
            PollingStatus::Ok => self.status = ConnStatus::Ok,
            PollingStatus::Failed => {
                self.status = ConnStatus::Bad;
                self.error = Some("server closed the connection unexpectedly\n".to_string());
            }
            _ => {}
        }
        result
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.events.lock().push(Event::Finish);
    }
}

impl std::fmt::Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandle")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dialer
// ============================================================================

#[derive(Clone, Default)]
pub struct MockDialer {
    state: Arc<DialerState>,
}

#[derive(Default)]
struct DialerState {
    dials: AtomicUsize,
    plan: Mutex<Plan>,
    events: EventLog,
}

impl MockDialer {
    pub fn new(plan: Plan) -> Self {
        let dialer = Self::default();
        dialer.set_plan(plan);
        dialer
    }

    pub fn set_plan(&self, plan: Plan) {
        *self.state.plan.lock() = plan;
    }

    pub fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> EventLog {
        Arc::clone(&self.state.events)
    }

    /// An empty connection whose socket logs into this dialer's event log.
    pub fn connection(&self) -> MockConnection {
        PgConnection::with_socket(MockSocket::with_events(Reactor::current(), self.events()))
    }
}

impl Dialer for MockDialer {
    type Handle = MockHandle;

    fn connect_start(&self, _conninfo: &str) -> Option<MockHandle> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        self.state.events.lock().push(Event::Start);
        let plan = self.state.plan.lock().clone();
        if plan.fail_start {
            return None;
        }
        Some(MockHandle::new(&plan, self.events()))
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Readiness waits resolve after one yield, or fail when asked to.
#[derive(Debug)]
pub struct MockSocket {
    reactor: Reactor,
    fd: Option<OwnedFd>,
    events: EventLog,
    fail_waits: bool,
}

impl MockSocket {
    pub fn with_events(reactor: Reactor, events: EventLog) -> Self {
        Self {
            reactor,
            fd: None,
            events,
            fail_waits: false,
        }
    }

    pub fn fail_waits(&mut self) {
        self.fail_waits = true;
    }

    async fn wait(&mut self, event: Event) -> io::Result<()> {
        self.events.lock().push(event);
        if self.fd.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is not open"));
        }
        if self.fail_waits {
            return Err(io::Error::other("injected wait failure"));
        }
        tokio::task::yield_now().await;
        Ok(())
    }
}

impl SocketAdapter for MockSocket {
    fn new(reactor: Reactor) -> Self {
        Self::with_events(reactor, EventLog::default())
    }

    fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    fn assign(&mut self, fd: OwnedFd) -> io::Result<()> {
        self.fd = Some(fd);
        Ok(())
    }

    fn rebind(&mut self, reactor: &Reactor) -> io::Result<()> {
        if let Some(fd) = &self.fd {
            self.fd = Some(fd.try_clone()?);
        }
        self.reactor = reactor.clone();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn close(&mut self) {
        self.fd = None;
    }

    async fn writable(&mut self) -> io::Result<()> {
        self.wait(Event::WriteWait).await
    }

    async fn readable(&mut self) -> io::Result<()> {
        self.wait(Event::ReadWait).await
    }
}

/// A connection that already holds a handle with `status` and `error`, and
/// an open socket.
pub fn connected(status: ConnStatus, error: &str) -> MockConnection {
    let events = EventLog::default();
    let plan = Plan {
        status,
        error: error.to_string(),
        ..Plan::default()
    };
    let handle = MockHandle::new(&plan, Arc::clone(&events));
    let mut conn: MockConnection =
        PgConnection::with_socket(MockSocket::with_events(Reactor::current(), events));
    let fd = handle
        .socket()
        .map(|fd| fd.try_clone_to_owned())
        .transpose()
        .expect("dup")
        .expect("mock handle has a socket");
    conn.socket_mut().assign(fd).expect("assign");
    *conn.native_handle_mut() = Some(handle);
    conn
}
