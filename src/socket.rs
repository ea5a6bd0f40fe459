//! Socket adapters.
//!
//! The adapter never reads or writes: the native handle owns the session's
//! I/O. The adapter holds a duplicate of the handle's descriptor registered
//! with a [`Reactor`] and reports readiness on it.

use std::future::Future;
use std::io;
use std::os::fd::OwnedFd;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::reactor::Reactor;

/// Readiness source bound to one descriptor and one reactor.
pub trait SocketAdapter: Send + 'static {
    /// An adapter bound to `reactor` with no descriptor.
    fn new(reactor: Reactor) -> Self
    where
        Self: Sized;

    fn reactor(&self) -> &Reactor;

    /// Take ownership of `fd` and register it with the reactor, replacing any
    /// previous descriptor.
    fn assign(&mut self, fd: OwnedFd) -> io::Result<()>;

    /// Move the adapter to another reactor.
    ///
    /// An open descriptor is duplicated and the duplicate registered with
    /// `reactor` before the old registration is dropped, so the session
    /// itself is never interrupted.
    fn rebind(&mut self, reactor: &Reactor) -> io::Result<()>;

    fn is_open(&self) -> bool;

    /// Deregister and close the descriptor.
    fn close(&mut self);

    /// Resolve once the descriptor is writable.
    fn writable(&mut self) -> impl Future<Output = io::Result<()>> + Send + '_;

    /// Resolve once the descriptor is readable.
    fn readable(&mut self) -> impl Future<Output = io::Result<()>> + Send + '_;
}

/// [`SocketAdapter`] over Tokio's `AsyncFd`.
#[derive(Debug)]
pub struct Socket {
    reactor: Reactor,
    fd: Option<AsyncFd<OwnedFd>>,
}

impl Socket {
    fn register(reactor: &Reactor, fd: OwnedFd) -> io::Result<AsyncFd<OwnedFd>> {
        let _entered = reactor.handle().enter();
        // SAFETY: `fd` is an open descriptor owned by the `AsyncFd` until it
        // is dropped, and `OwnedFd::as_raw_fd` always returns that descriptor.
        let registered =
            unsafe { AsyncFd::register_with_interest(fd, Interest::READABLE | Interest::WRITABLE) }?;
        Ok(registered)
    }

    fn open_fd(&self) -> io::Result<&AsyncFd<OwnedFd>> {
        self.fd
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is not open"))
    }
}

impl SocketAdapter for Socket {
    fn new(reactor: Reactor) -> Self {
        Self { reactor, fd: None }
    }

    fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    fn assign(&mut self, fd: OwnedFd) -> io::Result<()> {
        self.close();
        self.fd = Some(Self::register(&self.reactor, fd)?);
        Ok(())
    }

    fn rebind(&mut self, reactor: &Reactor) -> io::Result<()> {
        if let Some(current) = &self.fd {
            let duplicate = current.get_ref().try_clone()?;
            let registered = Self::register(reactor, duplicate)?;
            self.fd = Some(registered);
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
        let mut guard = self.open_fd()?.writable().await?;
        guard.clear_ready();
        Ok(())
    }

    async fn readable(&mut self) -> io::Result<()> {
        let mut guard = self.open_fd()?.readable().await?;
        guard.clear_ready();
        Ok(())
    }
}
