pub(crate) mod conn;
mod establish;
mod wait_queue;


use std::{
    collections::HashMap,
    process,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use derive_where::derive_where;
use tracing::{debug, warn};

use self::{conn::Connection, establish::ConnectionEstablisher, wait_queue::WaitQueue};
use crate::{
    auth::{AuthProvider, Credential},
    error::{Error, Result},
    options::{PoolOptions, ServerAddress},
};

pub use self::conn::pooled::PooledConnection;

/// A pool of connections to a single server address. All state is kept internally in an
/// `Arc`, so a `ConnectionPool` is a cheap-to-clone handle that any number of threads can
/// check connections out of concurrently.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<ConnectionPoolInner>,
}

/// The internal state of a connection pool.
#[derive_where(Debug)]
struct ConnectionPoolInner {
    /// The address of the server the pool's connections will connect to.
    address: ServerAddress,

    /// The maximum number of connections that the pool can have at a given time, including
    /// connections which are currently checked out of the pool. `None` means unbounded.
    max_pool_size: Option<u32>,

    /// If a checkout operation takes longer than `wait_queue_timeout`, the pool will return
    /// an error. If `wait_queue_timeout` is `None`, then the checkout operation will not time
    /// out.
    wait_queue_timeout: Option<Duration>,

    /// How often a pooled idle connection is probed for remote closure when checked out
    /// again. `Some(Duration::ZERO)` probes every time; `None` never probes.
    check_interval: Option<Duration>,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and are
    /// closed when checked back in or when popped off of the set of available connections.
    generation: AtomicU32,

    /// The process the pool belongs to, observed at construction or at the most recent
    /// clear. Connections inherited across a fork still have live peers that belong to the
    /// parent; a pid mismatch therefore clears the pool rather than reuse any of them.
    pid: AtomicU32,

    /// The ID of the next connection created by the pool.
    next_connection_id: AtomicU32,

    /// Threads acquire a permit from the wait queue before checking out a connection and
    /// release it when the connection is returned.
    wait_queue: WaitQueue,

    establisher: ConnectionEstablisher,

    /// The set of available connections in the pool. Ordering is not meaningful; staleness is
    /// governed by the generation tag and `check_interval`, not recency.
    connections: Mutex<Vec<Connection>>,

    #[derive_where(skip)]
    auth_provider: Arc<dyn AuthProvider>,
}

impl ConnectionPool {
    /// Creates a new pool for `address`. Connections are created lazily as checkouts demand
    /// them; authentication differentials at checkout are applied through `auth_provider`.
    pub fn new(
        address: ServerAddress,
        auth_provider: Arc<dyn AuthProvider>,
        options: impl Into<Option<PoolOptions>>,
    ) -> Self {
        let options = options.into().unwrap_or_default();

        let inner = ConnectionPoolInner {
            wait_queue: WaitQueue::new(options.max_pool_size, options.max_waiters()),
            establisher: ConnectionEstablisher::new(&options),
            max_pool_size: options.max_pool_size,
            wait_queue_timeout: options.wait_queue_timeout,
            check_interval: options.check_interval,
            generation: AtomicU32::new(0),
            pid: AtomicU32::new(process::id()),
            next_connection_id: AtomicU32::new(1),
            connections: Default::default(),
            auth_provider,
            address,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// The address this pool connects to.
    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    /// The current generation of the pool.
    pub fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection from the pool, creating one if no pooled connection is
    /// available and the pool is under its maximum size. Blocks while the pool is at capacity
    /// with every connection checked out, up to `wait_queue_timeout`.
    ///
    /// Before the connection is handed over, its wire version window is set from
    /// `min_wire_version`/`max_wire_version` and it is logged in or out as needed to match
    /// `all_credentials` (a map from auth source to credential).
    ///
    /// The returned guard checks the connection back in when dropped. Callers that need the
    /// connection to outlive the guard can take it with
    /// [`PooledConnection::detach`]; they are then responsible for handing it back to
    /// [`check_in`](Self::check_in).
    pub fn check_out(
        &self,
        all_credentials: &HashMap<String, Credential>,
        min_wire_version: i32,
        max_wire_version: i32,
    ) -> Result<PooledConnection> {
        // Get a connection first and authenticate second: a network failure during auth then
        // needs no special permit bookkeeping beyond the ordinary check-in path.
        let mut conn = self.acquire_or_create_connection()?;
        conn.set_wire_version_range(min_wire_version, max_wire_version);

        if let Err(err) = conn.check_auth(all_credentials) {
            conn.close();
            self.check_in(conn);
            return Err(err);
        }

        Ok(PooledConnection::new(conn, self.clone()))
    }

    /// Checks a connection back into the pool. If the connection is closed, was created
    /// before the most recent clear, or the pool is already holding `max_pool_size` available
    /// connections, it is discarded instead. Always releases the checkout permit.
    ///
    /// This is called automatically when a [`PooledConnection`] is dropped; it only needs to
    /// be invoked directly for connections that were detached.
    pub fn check_in(&self, conn: Connection) {
        // Never re-pool across a fork.
        if self.inner.pid.load(Ordering::SeqCst) != process::id() {
            self.inner.wait_queue.release();
            self.clear();
            return;
        }

        if conn.is_closed() {
            self.inner.wait_queue.release();
            return;
        }

        let discarded = {
            let mut connections = self.inner.connections.lock().unwrap();
            let at_capacity = self
                .inner
                .max_pool_size
                .is_some_and(|max| connections.len() as u32 >= max);

            if at_capacity || conn.is_stale(self.generation()) {
                Some(conn)
            } else {
                connections.push(conn);
                None
            }
        };

        // Closing happens outside the lock.
        if let Some(mut conn) = discarded {
            conn.close();
        }

        self.inner.wait_queue.release();
    }

    /// Increments the generation of the pool and closes every available connection.
    /// Outstanding checkouts keep their permits; their connections self-identify as stale
    /// when returned and are discarded then.
    pub fn clear(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.pid.store(process::id(), Ordering::SeqCst);

        let drained: Vec<Connection> = {
            let mut connections = self.inner.connections.lock().unwrap();
            std::mem::take(&mut *connections)
        };

        debug!(
            address = %self.inner.address,
            generation,
            closing = drained.len(),
            "clearing connection pool"
        );

        for mut conn in drained {
            conn.close();
        }
    }

    /// Waits for a permit, then pops an available connection or creates a fresh one. The
    /// permit is released on every failure path.
    fn acquire_or_create_connection(&self) -> Result<Connection> {
        if self.inner.pid.load(Ordering::SeqCst) != process::id() {
            warn!(
                address = %self.inner.address,
                "process id changed since the pool was created; discarding inherited connections"
            );
            self.clear();
        }

        if !self.inner.wait_queue.acquire(self.inner.wait_queue_timeout)? {
            return Err(self.wait_queue_timeout_error());
        }

        let popped = self.inner.connections.lock().unwrap().pop();
        let result = match popped {
            Some(conn) => self.check(conn),
            None => self.create_connection(),
        };

        match result {
            Ok(mut conn) => {
                conn.mark_checked_out();
                Ok(conn)
            }
            Err(err) => {
                self.inner.wait_queue.release();
                Err(err)
            }
        }
    }

    /// Checks whether the pool has been cleared since `conn` was created, or whether its peer
    /// has closed it, and if so establishes a replacement. If the replacement attempt also
    /// fails, the pool is cleared and the error propagates.
    fn check(&self, mut conn: Connection) -> Result<Connection> {
        let mut dead = false;

        if conn.is_closed() {
            dead = true;
        } else if conn.is_stale(self.generation()) {
            conn.close();
            dead = true;
        } else if self.probe_due(&conn) && conn.stream_probably_closed() {
            conn.close();
            dead = true;
        }

        if !dead {
            return Ok(conn);
        }

        debug!(
            address = %self.inner.address,
            id = conn.id,
            "pooled connection is dead; establishing a replacement"
        );

        match self.create_connection() {
            Ok(replacement) => Ok(replacement),
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }

    /// Whether enough time has passed since `conn` was last checked out for the liveness
    /// probe to run.
    fn probe_due(&self, conn: &Connection) -> bool {
        match self.inner.check_interval {
            Some(interval) => interval.is_zero() || conn.last_checkout.elapsed() > interval,
            None => false,
        }
    }

    fn create_connection(&self) -> Result<Connection> {
        let stream = self.inner.establisher.establish(&self.inner.address)?;

        Ok(Connection::new(
            self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst),
            self.inner.address.clone(),
            self.generation(),
            stream,
            Arc::clone(&self.inner.auth_provider),
        ))
    }

    fn wait_queue_timeout_error(&self) -> Error {
        let max_size = match self.inner.max_pool_size {
            Some(max) => max.to_string(),
            None => "unbounded".to_string(),
        };
        let timeout = match self.inner.wait_queue_timeout {
            Some(timeout) => format!("{:?}", timeout),
            None => "None".to_string(),
        };

        Error::connection_failure(format!(
            "Timed out waiting for socket from pool with max_size {} and wait_queue_timeout {}",
            max_size, timeout
        ))
    }

    #[cfg(test)]
    pub(crate) fn available_connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> Option<u32> {
        self.inner.wait_queue.available_permits()
    }

    /// Overwrites the recorded owning pid so the fork-detection path can be exercised without
    /// actually forking.
    #[cfg(test)]
    pub(crate) fn simulate_fork(&self) {
        let observed = self.inner.pid.load(Ordering::SeqCst);
        self.inner.pid.store(observed.wrapping_add(1), Ordering::SeqCst);
    }
}

impl Drop for ConnectionPoolInner {
    /// Automatic cleanup for the connection pool. Runs once all handles to the pool are
    /// gone; any connections still checked out at that point keep their guards alive and are
    /// closed when those guards drop.
    fn drop(&mut self) {
        for mut conn in self.connections.lock().unwrap().drain(..) {
            conn.close();
        }
    }
}
