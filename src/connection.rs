//! Connections and the capability traits used to reach them.
//!
//! [`Connection`] is the raw bundle of native handle, socket adapter and type
//! registry. [`Connectiable`] is what algorithms take: anything that can hand
//! out a connection by unwrapping at most one layer (a box, an option, an
//! `Arc`, a pool checkout).

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::native::{ConnStatus, NativeHandle, WireHandle};
use crate::reactor::Reactor;
use crate::socket::{Socket, SocketAdapter};
use crate::types::{Oid, PgType, TypeRegistry};

// ============================================================================
// Statistics
// ============================================================================

/// Counters recorded by the connect state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Calls into the handle's poll step
    pub polls: u32,
    pub write_waits: u32,
    pub read_waits: u32,
    /// Wall time from dial start to the final poll
    pub connect_time: Duration,
}

// ============================================================================
// Connection
// ============================================================================

/// Accessors shared by every connection representation.
pub trait Connection: Send + 'static {
    type Handle: NativeHandle;
    type Socket: SocketAdapter;

    fn type_registry(&self) -> &TypeRegistry;
    fn type_registry_mut(&mut self) -> &mut TypeRegistry;

    fn socket(&self) -> &Self::Socket;
    fn socket_mut(&mut self) -> &mut Self::Socket;

    fn native_handle(&self) -> Option<&Self::Handle>;

    /// Slot holding the native handle, writable so a dial can install one.
    fn native_handle_mut(&mut self) -> &mut Option<Self::Handle>;

    fn statistics(&self) -> Option<&Statistics> {
        None
    }

    fn statistics_mut(&mut self) -> Option<&mut Statistics> {
        None
    }
}

/// A PostgreSQL connection: native handle, socket adapter, type registry and
/// optional statistics.
///
/// Created unbound (no handle, no descriptor); a dial fills it in.
pub struct PgConnection<H = WireHandle, S = Socket> {
    // The adapter's duplicate is deregistered before the handle closes the
    // original descriptor.
    socket: S,
    handle: Option<H>,
    types: TypeRegistry,
    statistics: Option<Statistics>,
}

impl<H: NativeHandle, S: SocketAdapter> PgConnection<H, S> {
    /// An empty connection bound to `reactor`.
    pub fn new(reactor: Reactor) -> Self {
        Self::with_socket(S::new(reactor))
    }

    pub fn with_socket(socket: S) -> Self {
        Self {
            socket,
            handle: None,
            types: TypeRegistry::new(),
            statistics: None,
        }
    }

    /// Use `types` for custom type resolution.
    pub fn with_type_registry(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// Record [`Statistics`] for dials on this connection.
    pub fn with_statistics(mut self) -> Self {
        self.statistics = Some(Statistics::default());
        self
    }

    /// Close the descriptor and finalize the native handle.
    pub fn close(&mut self) {
        self.socket.close();
        self.handle = None;
    }

    /// Move this connection to another reactor without interrupting the
    /// session.
    pub fn rebind(&mut self, reactor: &Reactor) -> io::Result<()> {
        self.socket.rebind(reactor)
    }
}

impl<H: NativeHandle, S: SocketAdapter> Connection for PgConnection<H, S> {
    type Handle = H;
    type Socket = S;

    fn type_registry(&self) -> &TypeRegistry {
        &self.types
    }

    fn type_registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    fn socket(&self) -> &S {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    fn native_handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    fn native_handle_mut(&mut self) -> &mut Option<H> {
        &mut self.handle
    }

    fn statistics(&self) -> Option<&Statistics> {
        self.statistics.as_ref()
    }

    fn statistics_mut(&mut self) -> Option<&mut Statistics> {
        self.statistics.as_mut()
    }
}

impl<H: NativeHandle + std::fmt::Debug, S: SocketAdapter> std::fmt::Debug for PgConnection<H, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("handle", &self.handle)
            .field("socket_open", &self.socket.is_open())
            .field("custom_types", &self.types.len())
            .field("statistics", &self.statistics)
            .finish()
    }
}

// ============================================================================
// Connectiable
// ============================================================================

/// Anything that can lend out a [`Connection`].
///
/// Implementations unwrap exactly one layer; `Box<Option<C>>` is not
/// connectiable.
pub trait Connectiable: Send + 'static {
    type Target: Connection;

    /// The underlying connection, `None` for an empty wrapper.
    fn connection(&self) -> Option<&Self::Target>;

    fn connection_mut(&mut self) -> Option<&mut Self::Target>;

    /// Empty wrapper, missing native handle, or a handle in the bad state.
    fn is_bad(&self) -> bool {
        match self.connection().and_then(|c| c.native_handle()) {
            Some(handle) => handle.status() == ConnStatus::Bad,
            None => true,
        }
    }

    fn is_good(&self) -> bool {
        !self.is_bad()
    }

    /// Last native error text without trailing whitespace, empty if none.
    fn error_message(&self) -> &str {
        self.connection()
            .and_then(|c| c.native_handle())
            .and_then(|h| h.error_message())
            .map(str::trim_end)
            .unwrap_or("")
    }

    /// Reactor the connection's socket is bound to.
    fn reactor(&self) -> Option<&Reactor> {
        self.connection().map(|c| c.socket().reactor())
    }

    /// Oid of `T` in this connection's registry.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a custom type that was never registered.
    fn type_oid<T: PgType + ?Sized>(&self) -> Option<Oid> {
        self.connection().map(|c| c.type_registry().type_oid::<T>())
    }
}

impl<H: NativeHandle, S: SocketAdapter> Connectiable for PgConnection<H, S> {
    type Target = Self;

    fn connection(&self) -> Option<&Self> {
        Some(self)
    }

    fn connection_mut(&mut self) -> Option<&mut Self> {
        Some(self)
    }
}

impl<C: Connection + Connectiable<Target = C>> Connectiable for Box<C> {
    type Target = C;

    fn connection(&self) -> Option<&C> {
        Some(self)
    }

    fn connection_mut(&mut self) -> Option<&mut C> {
        Some(self)
    }
}

impl<C: Connection + Connectiable<Target = C>> Connectiable for Option<C> {
    type Target = C;

    fn connection(&self) -> Option<&C> {
        self.as_ref()
    }

    fn connection_mut(&mut self) -> Option<&mut C> {
        self.as_mut()
    }
}

/// Shared connections are readable by every owner; mutation needs the only
/// strong reference.
impl<C: Connection + Connectiable<Target = C> + Sync> Connectiable for Arc<C> {
    type Target = C;

    fn connection(&self) -> Option<&C> {
        Some(self)
    }

    fn connection_mut(&mut self) -> Option<&mut C> {
        Arc::get_mut(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected, MockHandle, MockSocket};

    type MockConnection = PgConnection<MockHandle, MockSocket>;

    #[tokio::test]
    async fn test_empty_connection_is_bad() {
        let conn = MockConnection::new(Reactor::current());
        assert!(conn.is_bad());
        assert!(!conn.is_good());
        assert_eq!(conn.error_message(), "");
        assert!(conn.reactor().is_some());
    }

    #[tokio::test]
    async fn test_status_decides_goodness() {
        let conn = connected(ConnStatus::Ok, "");
        assert!(conn.is_good());

        let conn = connected(ConnStatus::Bad, "FATAL:  too many connections\n");
        assert!(conn.is_bad());
        assert_eq!(conn.error_message(), "FATAL:  too many connections");
    }

    #[tokio::test]
    async fn test_wrappers_see_through_one_layer() {
        let boxed = Box::new(connected(ConnStatus::Ok, ""));
        assert!(boxed.is_good());

        let mut empty: Option<MockConnection> = None;
        assert!(empty.is_bad());
        assert!(empty.connection_mut().is_none());
        assert!(empty.reactor().is_none());

        let some = Some(connected(ConnStatus::Ok, ""));
        assert!(some.is_good());

        let mut shared = Arc::new(connected(ConnStatus::Ok, ""));
        assert!(shared.is_good());
        assert!(shared.connection_mut().is_some());
        let other = Arc::clone(&shared);
        assert!(shared.connection_mut().is_none());
        drop(other);
        assert!(shared.connection_mut().is_some());
    }

    #[tokio::test]
    async fn test_type_oid_through_capability() {
        let conn = connected(ConnStatus::Ok, "");
        assert_eq!(conn.type_oid::<i64>(), Some(Oid::INT8));
        assert_eq!(Box::new(conn).type_oid::<Vec<bool>>(), Some(Oid::BOOL_ARRAY));

        let empty: Option<MockConnection> = None;
        assert_eq!(empty.type_oid::<i64>(), None);
    }

    #[tokio::test]
    async fn test_close_releases_handle_and_socket() {
        let mut conn = connected(ConnStatus::Ok, "");
        let events = conn.native_handle().unwrap().events();
        conn.close();

        assert!(conn.is_bad());
        assert!(!conn.socket().is_open());
        assert!(events.lock().contains(&crate::testing::Event::Finish));
    }

    #[tokio::test]
    async fn test_statistics_opt_in() {
        let conn = MockConnection::new(Reactor::current());
        assert!(conn.statistics().is_none());

        let conn = MockConnection::new(Reactor::current()).with_statistics();
        assert_eq!(conn.statistics(), Some(&Statistics::default()));
        let json = serde_json::to_value(conn.statistics().unwrap()).unwrap();
        assert_eq!(json["polls"], 0);
    }
}
