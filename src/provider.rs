//! Connection providers.
//!
//! A provider delivers a connection to a [`Completion`]: by dialing
//! ([`ConnectionInfo`]), by handing over one it already has
//! ([`PgConnection`]), or by checking one out of a pool.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::connect::connect;
use crate::connection::{Connectiable, PgConnection};
use crate::error::{Error, Result};
use crate::native::config::{redact, PgConfig};
use crate::native::{Dialer, NativeHandle, WireDialer};
use crate::reactor::{Completion, Reactor};
use crate::socket::{Socket, SocketAdapter};
use crate::types::TypeRegistry;

/// Asynchronously delivers one connection.
pub trait ConnectionProvider: Send + 'static {
    type Connection: Connectiable;

    /// Obtain a connection and pass it, or the error, to `completion`.
    fn async_get_connection<F>(self, completion: Completion<F>)
    where
        F: FnOnce(Result<Self::Connection>) + Send + 'static;
}

/// Await a connection from `provider`.
///
/// The completion is dispatched on the calling task's reactor.
///
/// # Panics
///
/// Panics when called outside a Tokio runtime.
pub async fn get_connection<P: ConnectionProvider>(provider: P) -> Result<P::Connection> {
    let (tx, rx) = oneshot::channel();
    provider.async_get_connection(Completion::on(Reactor::current(), move |result: Result<P::Connection>| {
        let _ = tx.send(result);
    }));
    rx.await.map_err(|_| Error::Canceled)?
}

// ============================================================================
// ConnectionInfo
// ============================================================================

/// Everything needed to dial: connection string, reactor, dialer, and the
/// type registry new connections start from.
pub struct ConnectionInfo<D = WireDialer, S = Socket> {
    conninfo: Arc<str>,
    redacted: Arc<str>,
    reactor: Reactor,
    dialer: D,
    types: TypeRegistry,
    statistics: bool,
    connect_timeout: Option<Duration>,
    _socket: PhantomData<fn() -> S>,
}

impl ConnectionInfo {
    /// Dial with [`WireDialer`] over a Tokio [`Socket`].
    pub fn new(conninfo: impl Into<String>, reactor: Reactor) -> Self {
        Self::with_dialer(conninfo, reactor, WireDialer)
    }
}

impl<D: Dialer, S: SocketAdapter> ConnectionInfo<D, S> {
    /// `connect_timeout` from `conninfo` bounds every dial. A connection
    /// string that does not parse leaves dials unbounded; the dialer reports
    /// the parse error itself.
    pub fn with_dialer(conninfo: impl Into<String>, reactor: Reactor, dialer: D) -> Self {
        let conninfo: String = conninfo.into();
        let connect_timeout = PgConfig::parse(&conninfo)
            .ok()
            .and_then(|config| config.connect_timeout);
        Self {
            redacted: redact(&conninfo).into(),
            conninfo: conninfo.into(),
            reactor,
            dialer,
            types: TypeRegistry::new(),
            statistics: false,
            connect_timeout,
            _socket: PhantomData,
        }
    }

    /// Registry copied into every new connection.
    pub fn type_registry(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// Record [`Statistics`](crate::Statistics) on new connections.
    pub fn collect_statistics(mut self, enabled: bool) -> Self {
        self.statistics = enabled;
        self
    }

    pub fn conninfo(&self) -> &str {
        &self.conninfo
    }

    /// Limit on a single dial, `None` when unbounded.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Connection string with passwords masked.
    pub fn redacted(&self) -> &str {
        &self.redacted
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// An empty connection configured like the ones this provider dials.
    pub fn new_connection(&self) -> PgConnection<D::Handle, S> {
        let conn = PgConnection::new(self.reactor.clone()).with_type_registry(self.types.clone());
        if self.statistics {
            conn.with_statistics()
        } else {
            conn
        }
    }

    /// Dial a new connection.
    ///
    /// Errors mention the redacted connection string only. A dial that
    /// outlives `connect_timeout` fails with [`Error::Timeout`].
    pub async fn connect(&self) -> Result<PgConnection<D::Handle, S>> {
        let mut conn = self.new_connection();
        let dial = connect(&mut conn, &self.dialer, &self.conninfo);
        let result = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| Error::Timeout)?,
            None => dial.await,
        };
        result.map_err(|e| e.with_conninfo(&self.redacted))?;
        Ok(conn)
    }
}

impl<D: Clone, S> Clone for ConnectionInfo<D, S> {
    fn clone(&self) -> Self {
        Self {
            conninfo: Arc::clone(&self.conninfo),
            redacted: Arc::clone(&self.redacted),
            reactor: self.reactor.clone(),
            dialer: self.dialer.clone(),
            types: self.types.clone(),
            statistics: self.statistics,
            connect_timeout: self.connect_timeout,
            _socket: PhantomData,
        }
    }
}

impl<D, S> std::fmt::Debug for ConnectionInfo<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("conninfo", &self.redacted)
            .field("custom_types", &self.types.len())
            .field("statistics", &self.statistics)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl<D: Dialer, S: SocketAdapter> ConnectionProvider for ConnectionInfo<D, S> {
    type Connection = PgConnection<D::Handle, S>;

    fn async_get_connection<F>(self, completion: Completion<F>)
    where
        F: FnOnce(Result<Self::Connection>) + Send + 'static,
    {
        let reactor = self.reactor.clone();
        reactor.spawn(async move {
            let result = self.connect().await;
            completion.complete(result);
        });
    }
}

/// A connection provides itself.
impl<H: NativeHandle, S: SocketAdapter> ConnectionProvider for PgConnection<H, S> {
    type Connection = Self;

    fn async_get_connection<F>(self, completion: Completion<F>)
    where
        F: FnOnce(Result<Self>) + Send + 'static,
    {
        completion.complete(Ok(self));
    }
}

// ============================================================================
// Source
// ============================================================================

/// Either a connection in hand or a provider that can dial one.
///
/// Resolved once at the call boundary, so callers accept both without
/// knowing which they got.
pub enum Source<C, P> {
    Ready(C),
    Provider(P),
}

impl<C, P> Source<C, P>
where
    C: Connectiable,
    P: ConnectionProvider<Connection = C>,
{
    /// Reuse `previous` while it is good, otherwise go to `provider`.
    pub fn from_previous(previous: Option<C>, provider: P) -> Self {
        match previous {
            Some(conn) if conn.is_good() => Source::Ready(conn),
            _ => Source::Provider(provider),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Source::Ready(_))
    }
}

impl<C, P> ConnectionProvider for Source<C, P>
where
    C: Connectiable,
    P: ConnectionProvider<Connection = C>,
{
    type Connection = C;

    fn async_get_connection<F>(self, completion: Completion<F>)
    where
        F: FnOnce(Result<C>) + Send + 'static,
    {
        match self {
            Source::Ready(conn) => completion.complete(Ok(conn)),
            Source::Provider(provider) => provider.async_get_connection(completion),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::native::{ConnStatus, PollingStatus};
    use crate::testing::{connected, MockDialer, MockSocket, Plan};

    type MockInfo = ConnectionInfo<MockDialer, MockSocket>;

    fn info(dialer: &MockDialer, conninfo: &str) -> MockInfo {
        ConnectionInfo::with_dialer(conninfo, Reactor::current(), dialer.clone())
    }

    #[tokio::test]
    async fn test_connection_info_dials() {
        let dialer = MockDialer::new(Plan::script([PollingStatus::Reading, PollingStatus::Ok]));
        let provider = info(&dialer, "host=db").collect_statistics(true);

        let conn = get_connection(provider).await.unwrap();

        assert!(conn.is_good());
        assert_eq!(dialer.dials(), 1);
        assert_eq!(conn.statistics().unwrap().polls, 2);
    }

    #[tokio::test]
    async fn test_connection_info_redacts_errors() {
        let dialer = MockDialer::new(Plan {
            status: ConnStatus::Bad,
            error: "password authentication failed".to_string(),
            ..Plan::default()
        });
        let provider = info(&dialer, "host=db password=hunter2");
        assert_eq!(provider.redacted(), "host=db password=***");

        let err = get_connection(provider).await.unwrap_err();

        let text = err.to_string();
        assert!(text.contains("password=***"), "{}", text);
        assert!(!text.contains("hunter2"), "{}", text);
    }

    #[tokio::test]
    async fn test_connection_info_copies_registry() {
        struct Mood;
        impl crate::PgType for Mood {
            fn type_name() -> std::borrow::Cow<'static, str> {
                "mood".into()
            }
        }

        let mut types = TypeRegistry::new();
        types.set_type_oid::<Mood>(crate::Oid(16500));
        let dialer = MockDialer::new(Plan::default());
        let conn = get_connection(info(&dialer, "").type_registry(types))
            .await
            .unwrap();

        assert_eq!(conn.type_oid::<Mood>(), Some(crate::Oid(16500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_info_honors_connect_timeout() {
        // A real socket whose peer never writes: the read wait never resolves.
        let dialer = MockDialer::new(Plan::script([PollingStatus::Reading]));
        let provider: ConnectionInfo<MockDialer, Socket> = ConnectionInfo::with_dialer(
            "host=db connect_timeout=1",
            Reactor::current(),
            dialer.clone(),
        );
        assert_eq!(provider.connect_timeout(), Some(Duration::from_secs(1)));

        assert!(matches!(provider.connect().await, Err(Error::Timeout)));
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn test_connection_info_without_timeout() {
        let dialer = MockDialer::new(Plan::default());
        assert_eq!(info(&dialer, "host=db").connect_timeout(), None);
        assert_eq!(info(&dialer, "host=db connect_timeout=0").connect_timeout(), None);
    }

    #[tokio::test]
    async fn test_connection_provides_itself() {
        let conn = connected(ConnStatus::Ok, "");
        let conn = get_connection(conn).await.unwrap();
        assert!(conn.is_good());
    }

    #[tokio::test]
    async fn test_source_reuses_good_connection() {
        let dialer = MockDialer::new(Plan::default());

        let source = Source::from_previous(Some(connected(ConnStatus::Ok, "")), info(&dialer, ""));
        assert!(source.is_ready());
        assert!(get_connection(source).await.unwrap().is_good());
        assert_eq!(dialer.dials(), 0);

        let source = Source::from_previous(Some(connected(ConnStatus::Bad, "")), info(&dialer, ""));
        assert!(!source.is_ready());
        assert!(get_connection(source).await.unwrap().is_good());
        assert_eq!(dialer.dials(), 1);

        let source = Source::from_previous(None, info(&dialer, ""));
        assert!(get_connection(source).await.unwrap().is_good());
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_dropped_completion_is_canceled() {
        struct Forgetful;

        impl ConnectionProvider for Forgetful {
            type Connection = crate::testing::MockConnection;

            fn async_get_connection<F>(self, completion: Completion<F>)
            where
                F: FnOnce(Result<Self::Connection>) + Send + 'static,
            {
                drop(completion);
            }
        }

        assert!(matches!(
            get_connection(Forgetful).await,
            Err(Error::Canceled)
        ));
    }
}
