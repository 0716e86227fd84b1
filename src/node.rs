//! One server endpoint: a connection pool plus a health state machine.
//!
//! ```text
//!            N consecutive connectivity failures
//!  HEALTHY ---------------------------------------> UNHEALTHY
//!     ^                                                 |
//!     |               probe succeeds                    | probe every
//!     +-------------------------------------------------+ probe_interval
//! ```
//!
//! Only connectivity failures (connect, I/O, timeout) move the counter. A
//! server that answers with an application error is alive. A node never
//! retries; hopping to another node is the cluster's job.
//!
//! Attempts run on the node's own workers, one per connection slot, so a
//! node that stops answering only ties up its own threads.
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    ClientError,
    config::{NodeAddress, NodeOptions},
    connection::Connection,
    operation::{Operation, Ping},
    pool::{ConnectionPool, PoolStats},
    protocol::ThreadPool,
};

const HEALTHY: u8 = 0;
const UNHEALTHY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Snapshot of a node for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub address: NodeAddress,
    pub health: Health,
    pub consecutive_failures: u32,
    pub pool: PoolStats,
}

/// Decides whether an unhealthy node can take traffic again.
pub trait HealthCheck: Send + Sync + 'static {
    fn check(&self, conn: &mut Connection, timeout: Duration) -> Result<(), ClientError>;
}

/// Sends a ping and expects a pong.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHealthCheck;

impl HealthCheck for PingHealthCheck {
    fn check(&self, conn: &mut Connection, timeout: Duration) -> Result<(), ClientError> {
        let (op, future) = Operation::from_command(Ping)?;
        let mut op = op.with_timeout(Some(timeout));
        conn.send(&mut op)?;
        future.wait()
    }
}

pub struct Node {
    address: NodeAddress,
    pool: ConnectionPool,
    workers: ThreadPool,
    health: AtomicU8,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    probe_interval: Duration,
    probe_timeout: Duration,
    probing: AtomicBool,
    checker: Arc<dyn HealthCheck>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("health", &self.health())
            .field("failures", &self.consecutive_failures())
            .finish()
    }
}

impl Node {
    pub fn new(address: NodeAddress, options: NodeOptions) -> Self {
        Self {
            failure_threshold: options.failure_threshold.max(1),
            probe_interval: options.probe_interval,
            probe_timeout: options.connect_timeout,
            workers: ThreadPool::new(&format!("kvlink-io-{address}"), options.max_connections),
            pool: ConnectionPool::new(address.clone(), options),
            address,
            health: AtomicU8::new(HEALTHY),
            consecutive_failures: AtomicU32::new(0),
            probing: AtomicBool::new(false),
            checker: Arc::new(PingHealthCheck),
        }
    }

    pub fn with_health_check<H: HealthCheck>(mut self, check: H) -> Self {
        self.checker = Arc::new(check);
        self
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn health(&self) -> Health {
        match self.health.load(Ordering::SeqCst) {
            HEALTHY => Health::Healthy,
            _ => Health::Unhealthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> NodeState {
        NodeState {
            address: self.address.clone(),
            health: self.health(),
            consecutive_failures: self.consecutive_failures(),
            pool: self.pool.stats(),
        }
    }

    /// Opens the pool's minimum connections. A node that cannot be reached
    /// starts unhealthy with a probe scheduled.
    pub fn start(self: &Arc<Self>) -> Result<usize, ClientError> {
        self.pool.warm_up().inspect_err(|e| {
            warn!("node {} unreachable at start: {e}", self.address);
            self.mark_unhealthy();
        })
    }

    /// Runs `op` on one pooled connection.
    ///
    /// `Ok` means the operation's future was completed by a response. On
    /// `Err` the future is still pending, unless the error is `Cancelled`.
    pub fn execute(self: &Arc<Self>, op: &mut Operation) -> Result<(), ClientError> {
        op.record_attempt(&self.address);
        debug!("executing {op:?} on {}", self.address);

        let result = self.pool.borrow().and_then(|mut conn| {
            let sent = conn.send(op);
            self.pool.release(conn);
            sent
        });

        match &result {
            Ok(()) => self.record_success(),
            Err(e) if e.is_connectivity_failure() && !op.is_cancelled() => {
                self.record_failure(e)
            }
            Err(_) => {}
        }
        result
    }

    /// Queues `job` on this node's workers. Fails with `Shutdown` once the
    /// node has been shut down.
    pub(crate) fn spawn<F>(&self, job: F) -> Result<(), ClientError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.workers.execute(job).map_err(|_| ClientError::Shutdown)
    }

    /// Runs the health check once on a pooled connection.
    pub fn probe(&self) -> Result<(), ClientError> {
        let mut conn = self.pool.borrow()?;
        let result = self.checker.check(&mut conn, self.probe_timeout);
        self.pool.release(conn);
        result
    }

    /// Stops lending connections, closes idle ones and refuses new
    /// attempts. Any running probe stops at its next tick.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.workers.shutdown();
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_failure(self: &Arc<Self>, cause: &ClientError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("node {} failure {failures}: {cause}", self.address);
        if failures >= self.failure_threshold {
            self.mark_unhealthy();
        }
    }

    fn mark_unhealthy(self: &Arc<Self>) {
        if self.health.swap(UNHEALTHY, Ordering::SeqCst) == HEALTHY {
            warn!(
                "node {} marked unhealthy after {} consecutive failures",
                self.address,
                self.consecutive_failures()
            );
        }
        self.schedule_probe();
    }

    fn mark_healthy(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.health.swap(HEALTHY, Ordering::SeqCst) == UNHEALTHY {
            info!("node {} is healthy again", self.address);
        }
    }

    fn schedule_probe(self: &Arc<Self>) {
        if self.probing.swap(true, Ordering::SeqCst) {
            return;
        }

        let node = Arc::downgrade(self);
        let interval = self.probe_interval;
        let spawned = thread::Builder::new()
            .name(format!("kvlink-probe-{}", self.address))
            .spawn(move || probe_loop(node, interval));

        if let Err(e) = spawned {
            warn!("could not start probe for {}: {e}", self.address);
            self.probing.store(false, Ordering::SeqCst);
        }
    }
}

/// Probes until the node recovers, shuts down or is dropped.
fn probe_loop(node: Weak<Node>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(node) = node.upgrade() else {
            return;
        };
        if node.pool.is_shutting_down() {
            node.probing.store(false, Ordering::SeqCst);
            return;
        }

        match node.probe() {
            Ok(()) => {
                node.probing.store(false, Ordering::SeqCst);
                node.mark_healthy();
                return;
            }
            Err(e) => debug!("probe of {} failed: {e}", node.address),
        }
    }
}
