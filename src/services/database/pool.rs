//! Connection/session pool.
//!
//! Maps small integer handles to live driver sessions and keeps, per slot, the
//! cancel handle of the query currently running on it. The slot table sits
//! behind one mutex; the sessions themselves are shared out as
//! [`SharedConnection`]s and are never touched while that lock is held.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::drivers::ConnectionFactory;
use super::error::{DbError, DbResult};
use super::traits::row::MAX_RESULT_ROWS;
use super::traits::{CancelHandle, ConnectionConfig, ConnectionInfo, SensitiveString, SharedConnection};

/// Handle a client uses to address a pooled connection
pub type ConnId = u32;

/// Default number of simultaneously open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// One occupied slot.
struct Slot {
    id: ConnId,
    conn: SharedConnection,
    cancel: Option<CancelHandle>,
    query_active: bool,
}

struct PoolState {
    slots: Vec<Option<Slot>>,
    /// Slots promised to connects that are still handshaking
    reserved: usize,
    next_id: ConnId,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn slot_mut(&mut self, id: ConnId) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.id == id)
    }
}

/// A pooled connection as reported by [`ConnectionPool::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PooledConnection {
    pub id: ConnId,
    #[serde(flatten)]
    pub info: ConnectionInfo,
}

/// Fixed-capacity table of open sessions.
pub struct ConnectionPool {
    factory: Arc<ConnectionFactory>,
    max_result_rows: usize,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ConnectionPool")
            .field("capacity", &state.slots.len())
            .field("active", &state.occupied())
            .field("next_id", &state.next_id)
            .finish()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(
            Arc::new(ConnectionFactory::with_builtin_drivers()),
            DEFAULT_MAX_CONNECTIONS,
        )
    }
}

impl ConnectionPool {
    /// Create an empty pool holding at most `capacity` sessions.
    pub fn new(factory: Arc<ConnectionFactory>, capacity: usize) -> Self {
        Self {
            factory,
            max_result_rows: MAX_RESULT_ROWS,
            state: Mutex::new(PoolState {
                slots: (0..capacity.max(1)).map(|_| None).collect(),
                reserved: 0,
                next_id: 1,
            }),
        }
    }

    /// Row cap applied to sessions whose connection string does not set `max_rows`.
    pub fn with_max_result_rows(mut self, rows: usize) -> Self {
        self.max_result_rows = rows.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of sessions
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of open sessions
    pub fn active_count(&self) -> usize {
        self.lock().occupied()
    }

    /// Open a session and return its handle.
    ///
    /// The handshake runs without the pool lock; a slot is reserved up front
    /// so a full pool fails before any network traffic.
    pub async fn connect(
        &self,
        connstr: &str,
        password: Option<SensitiveString>,
    ) -> DbResult<ConnId> {
        let mut config = ConnectionConfig::parse(connstr, password)?;
        config.max_result_rows.get_or_insert(self.max_result_rows);

        {
            let mut state = self.lock();
            let capacity = state.slots.len();
            if state.occupied() + state.reserved >= capacity {
                tracing::warn!(capacity, "connection pool exhausted");
                return Err(DbError::TooManyConnections(capacity));
            }
            state.reserved += 1;
        }

        let driver = config.database_type;
        let connected = self.factory.connect(config).await;

        let mut state = self.lock();
        state.reserved -= 1;
        let conn: SharedConnection = Arc::from(connected?);

        let id = state.next_id;
        let Some(free) = state.slots.iter_mut().find(|slot| slot.is_none()) else {
            return Err(DbError::Internal("reserved slot vanished".into()));
        };
        *free = Some(Slot {
            id,
            conn,
            cancel: None,
            query_active: false,
        });
        state.next_id += 1;

        tracing::info!(conn_id = id, %driver, "connection opened");
        Ok(id)
    }

    /// Close a session and free its slot. A query still running on it is cancelled first.
    pub async fn disconnect(&self, id: ConnId) -> DbResult<()> {
        let slot = {
            let mut state = self.lock();
            state
                .slots
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|s| s.id == id))
                .and_then(Option::take)
                .ok_or(DbError::InvalidConnection(id))?
        };

        if let (true, Some(handle)) = (slot.query_active, slot.cancel.as_ref()) {
            if let Err(e) = slot.conn.cancel_query(handle).await {
                tracing::warn!(conn_id = id, error = %e, "cancel on disconnect failed");
            }
        }
        slot.conn.disconnect().await?;
        tracing::info!(conn_id = id, "connection closed");
        Ok(())
    }

    /// Session behind `id`, if it is open
    pub fn get(&self, id: ConnId) -> Option<SharedConnection> {
        self.lock().slot_mut(id).map(|slot| Arc::clone(&slot.conn))
    }

    /// Like [`get`](Self::get), failing with `InvalidConnection` for unknown ids.
    pub fn require(&self, id: ConnId) -> DbResult<SharedConnection> {
        self.get(id).ok_or(DbError::InvalidConnection(id))
    }

    /// Credential-free description of every open session, ordered by id
    pub fn list(&self) -> Vec<PooledConnection> {
        let state = self.lock();
        let mut list: Vec<_> = state
            .slots
            .iter()
            .flatten()
            .map(|slot| PooledConnection {
                id: slot.id,
                info: slot.conn.info(),
            })
            .collect();
        list.sort_by_key(|entry| entry.id);
        list
    }

    /// Arm cancellation for the query about to run on `id`.
    ///
    /// A handle left over from an earlier query is dropped first.
    pub fn prepare_cancel(&self, id: ConnId) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state.slot_mut(id).ok_or(DbError::InvalidConnection(id))?;
        if slot.cancel.take().is_some() {
            tracing::debug!(conn_id = id, "dropping stale cancel handle");
        }
        slot.cancel = Some(slot.conn.prepare_cancel()?);
        slot.query_active = true;
        Ok(())
    }

    /// Release the cancel handle of the query that just returned on `id`.
    ///
    /// A no-op when the session was closed in the meantime.
    pub fn finish_query(&self, id: ConnId) {
        let mut state = self.lock();
        if let Some(slot) = state.slot_mut(id) {
            slot.cancel = None;
            slot.query_active = false;
            slot.conn.state().disarm_cancel();
        }
    }

    /// Whether a query is currently running on `id`
    pub fn is_query_active(&self, id: ConnId) -> bool {
        self.lock().slot_mut(id).is_some_and(|slot| slot.query_active)
    }

    /// Interrupt the query running on `id`.
    ///
    /// Returns `false` when nothing is running there. The handle is cloned under
    /// the lock and the interrupt is sent after releasing it, since delivering
    /// it may mean opening a side connection.
    pub async fn cancel(&self, id: ConnId) -> DbResult<bool> {
        let (conn, handle) = {
            let mut state = self.lock();
            let slot = state.slot_mut(id).ok_or(DbError::InvalidConnection(id))?;
            match (&slot.cancel, slot.query_active) {
                (Some(handle), true) => (Arc::clone(&slot.conn), handle.clone()),
                _ => return Ok(false),
            }
        };

        conn.cancel_query(&handle).await?;
        tracing::debug!(conn_id = id, "cancel delivered");
        Ok(true)
    }

    /// Close every session, logging failures instead of stopping at the first one.
    pub async fn close_all(&self) {
        let ids: Vec<ConnId> = self.list().into_iter().map(|entry| entry.id).collect();
        for id in ids {
            if let Err(e) = self.disconnect(id).await {
                tracing::warn!(conn_id = id, error = %e, "failed to close connection");
            }
        }
    }
}
