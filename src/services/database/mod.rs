//! Database layer: driver contract, drivers, connection pool and query engine.

pub mod drivers;
pub mod engine;
pub mod error;
pub mod pool;
pub mod sql;
pub mod traits;

pub use drivers::ConnectionFactory;
pub use engine::{AsyncQuery, AsyncQueue, QueryEngine, QueryInput, QueryOutput, QueryStatus};
pub use error::{DbError, DbResult};
pub use pool::{ConnId, ConnectionPool, PooledConnection};
