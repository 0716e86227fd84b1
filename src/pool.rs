//! Per-node connection pool.
//!
//! The pool is the engine's backpressure: no node ever has more than
//! `max_connections` sockets open, counting both idle connections and the
//! ones currently lent out. Borrowers past that bound either wait for a
//! release (up to `borrow_timeout`) or fail fast with
//! [`ClientError::PoolExhausted`].
//!
//! Connections are lent by value. A connection that comes back closed is
//! dropped and its slot freed; the pool never reinserts it. Whenever the
//! idle count falls below `min_connections` and there is room under the
//! maximum, replacements are opened on a background thread so neither the
//! borrower nor the releaser waits on a connect.
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{
    ClientError,
    config::{NodeAddress, NodeOptions},
    connection::{Connection, Liveness},
    lock,
};

/// Point-in-time counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus in use, including connects in progress.
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    open: usize,
    in_use: usize,
    /// Connects in progress that will land in `idle`.
    connecting: usize,
    created: u64,
    discarded: u64,
    replenishing: bool,
    shutting_down: bool,
}

impl PoolState {
    fn discard(&mut self, conn: Connection) {
        self.open = self.open.saturating_sub(1);
        self.discarded += 1;
        trace!("discarding connection {}", conn.id());
        drop(conn);
    }
}

struct Inner {
    address: NodeAddress,
    options: NodeOptions,
    state: Mutex<PoolState>,
    cond: Condvar,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.address)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates an empty pool. Nothing is opened until [`warm_up`](Self::warm_up)
    /// or the first borrow.
    pub fn new(address: NodeAddress, options: NodeOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                address,
                options,
                state: Mutex::new(PoolState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.inner.address
    }

    pub fn options(&self) -> &NodeOptions {
        &self.inner.options
    }

    /// Lends out an idle connection, or opens a new one while under the
    /// maximum. Idle connections the server closed, or that hold stray bytes,
    /// are discarded on the way.
    pub fn borrow(&self) -> Result<Connection, ClientError> {
        let options = &self.inner.options;
        let deadline = Instant::now() + options.borrow_timeout;
        let mut state = lock(&self.inner.state);

        loop {
            if state.shutting_down {
                return Err(ClientError::Shutdown);
            }

            if let Some(mut conn) = state.idle.pop_front() {
                match conn.liveness() {
                    Liveness::Ready => {
                        state.in_use += 1;
                        trace!("borrowed connection {} to {}", conn.id(), self.inner.address);
                        let replenish = self.claim_replenish(&mut state);
                        drop(state);
                        if replenish {
                            self.spawn_replenish();
                        }
                        return Ok(conn);
                    }
                    stale => {
                        debug!(
                            "idle connection {} to {} is unusable: {stale:?}",
                            conn.id(),
                            self.inner.address
                        );
                        state.discard(conn);
                        continue;
                    }
                }
            }

            if state.open < options.max_connections {
                state.open += 1;
                state.in_use += 1;
                drop(state);
                return match self.open_reserved() {
                    Ok(conn) => {
                        let replenish = self.claim_replenish(&mut lock(&self.inner.state));
                        if replenish {
                            self.spawn_replenish();
                        }
                        Ok(conn)
                    }
                    Err(e) => {
                        let mut state = lock(&self.inner.state);
                        state.open = state.open.saturating_sub(1);
                        state.in_use = state.in_use.saturating_sub(1);
                        drop(state);
                        self.inner.cond.notify_all();
                        Err(e)
                    }
                };
            }

            if !options.block_on_exhausted {
                return Err(ClientError::PoolExhausted(self.inner.address.to_string()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::PoolExhausted(self.inner.address.to_string()));
            }
            trace!("waiting for a connection to {}", self.inner.address);
            state = match self.inner.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Takes a connection back. Closed connections, and every connection
    /// once the pool is shutting down, are closed and forgotten.
    pub fn release(&self, conn: Connection) {
        let mut state = lock(&self.inner.state);
        state.in_use = state.in_use.saturating_sub(1);

        if conn.is_closed() || state.shutting_down {
            state.discard(conn);
        } else {
            trace!("released connection {} to {}", conn.id(), self.inner.address);
            state.idle.push_back(conn);
        }

        let replenish = self.claim_replenish(&mut state);
        drop(state);
        self.inner.cond.notify_all();

        if replenish {
            self.spawn_replenish();
        }
    }

    /// Opens connections until `min_connections` sit idle, or the pool is at
    /// its maximum. Returns how many were opened, or the first connect error.
    pub fn warm_up(&self) -> Result<usize, ClientError> {
        let options = &self.inner.options;
        let mut opened = 0;
        loop {
            {
                let mut state = lock(&self.inner.state);
                if state.shutting_down
                    || state.idle.len() + state.connecting >= options.min_connections
                    || state.open >= options.max_connections
                {
                    return Ok(opened);
                }
                state.open += 1;
                state.connecting += 1;
            }

            match self.connect() {
                Ok(conn) => {
                    let mut state = lock(&self.inner.state);
                    state.connecting -= 1;
                    state.created += 1;
                    if state.shutting_down {
                        state.discard(conn);
                    } else {
                        state.idle.push_back(conn);
                    }
                    drop(state);
                    self.inner.cond.notify_all();
                    opened += 1;
                }
                Err(e) => {
                    let mut state = lock(&self.inner.state);
                    state.connecting -= 1;
                    state.open = state.open.saturating_sub(1);
                    drop(state);
                    self.inner.cond.notify_all();
                    return Err(e);
                }
            }
        }
    }

    /// Rejects further borrows and closes idle connections now. Lent-out
    /// connections are closed as they come back.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        let idle: Vec<_> = state.idle.drain(..).collect();
        for conn in idle {
            state.discard(conn);
        }
        debug!(
            "pool for {} shutting down with {} connections in use",
            self.inner.address, state.in_use
        );
        drop(state);
        self.inner.cond.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }

    /// Waits until every connection has been closed. Returns false on timeout.
    pub fn await_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        while state.open > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.inner.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            in_use: state.in_use,
            created: state.created,
            discarded: state.discarded,
        }
    }

    fn connect(&self) -> Result<Connection, ClientError> {
        let options = &self.inner.options;
        Connection::open(
            &self.inner.address,
            options.connect_timeout,
            options.request_timeout,
            options.max_frame_size,
        )
    }

    /// Opens a connection for a slot already counted in `open` and `in_use`.
    fn open_reserved(&self) -> Result<Connection, ClientError> {
        let conn = self.connect()?;
        lock(&self.inner.state).created += 1;
        debug!("opened connection {} to {}", conn.id(), self.inner.address);
        Ok(conn)
    }

    /// Claims the single replenish slot when idle connections fell below the
    /// minimum and the pool still has room.
    fn claim_replenish(&self, state: &mut PoolState) -> bool {
        let options = &self.inner.options;
        let due = !state.shutting_down
            && !state.replenishing
            && state.idle.len() + state.connecting < options.min_connections
            && state.open < options.max_connections;
        if due {
            state.replenishing = true;
        }
        due
    }

    fn spawn_replenish(&self) {
        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("kvlink-replenish-{}", self.inner.address))
            .spawn(move || {
                if let Err(e) = pool.warm_up() {
                    warn!("could not replenish pool for {}: {e}", pool.inner.address);
                }
                lock(&pool.inner.state).replenishing = false;
            });

        if let Err(e) = spawned {
            warn!("could not start replenish thread: {e}");
            lock(&self.inner.state).replenishing = false;
        }
    }
}
