use std::ops::{Deref, DerefMut};

use super::Connection;
use crate::pool::ConnectionPool;

/// A connection checked out from a [`ConnectionPool`].
///
/// The connection is checked back in when this guard goes out of scope, on success and error
/// paths alike; the pool then decides whether to retain or discard it. Callers that need to
/// hold the connection beyond the scope can take ownership with [`detach`](Self::detach).
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: ConnectionPool,
}

impl PooledConnection {
    pub(crate) fn new(conn: Connection, pool: ConnectionPool) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Take ownership of the underlying connection, keeping it checked out. The pool permit
    /// stays held until the connection is handed to
    /// [`ConnectionPool::check_in`](crate::ConnectionPool::check_in).
    pub fn detach(mut self) -> Connection {
        // The option is only empty once the guard has been dropped or detached, neither of
        // which can be observed here.
        self.conn.take().unwrap()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }
}
