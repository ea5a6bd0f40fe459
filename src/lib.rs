//! pgdial - non-blocking PostgreSQL connection establishment.
//!
//! A connection is a native protocol handle paired with a socket adapter
//! registered on a Tokio reactor. [`connect`] and [`async_connect`] drive
//! the handle's handshake one non-blocking step at a time, suspending only
//! on socket readiness. On top of that sit a binary parameter encoder with
//! a per-connection type registry, connection providers and a pool.
//!
//! ```no_run
//! # async fn demo() -> pgdial::Result<()> {
//! use pgdial::{Connectiable, Pool, PoolConfig};
//!
//! let pool = Pool::connect(PoolConfig::new("host=localhost user=postgres")).await?;
//! let conn = pool.acquire().await?;
//! assert!(conn.is_good());
//! # Ok(())
//! # }
//! ```

pub mod connect;
pub mod connection;
pub mod encode;
pub mod error;
pub mod native;
pub mod pool;
pub mod provider;
pub mod query;
pub mod reactor;
pub mod socket;
pub mod types;

pub use connect::{async_connect, connect, ConnectState};
pub use connection::{Connectiable, Connection, PgConnection, Statistics};
pub use encode::{Encode, Null};
pub use error::{Error, Result};
pub use native::{ConnStatus, Dialer, NativeHandle, PgConfig, PollingStatus, WireDialer, WireHandle};
pub use pool::{Pool, PoolConfig, PoolStatus, PooledConnection};
pub use provider::{get_connection, ConnectionInfo, ConnectionProvider, Source};
pub use query::{Query, QueryParams};
pub use reactor::{Completion, Executor, Reactor, Strand};
pub use socket::{Socket, SocketAdapter};
pub use types::{Oid, PgType, TypeRegistry};

#[cfg(test)]
mod testing;
