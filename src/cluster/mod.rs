//! The dispatcher: a set of nodes, a selection strategy and a retry budget.
//!
//! # Overview
//!
//! Every submitted operation becomes a job on the cluster's dispatch pool.
//! That job only picks a node and hands the attempt to the node's own
//! workers, so it never waits on a socket. The attempt then either finishes
//! or queues the next dispatch as a fresh job. Retries never recurse, so a
//! storm of fast failures cannot grow the stack, and a node that stops
//! answering holds up only the workers of that node.
//!
//! # Retry policy
//!
//! - Connectivity failures (`Connect`, `Io`, `Timeout`) and `PoolExhausted`
//!   hop to a node this operation has not tried, until `retry_count` extra
//!   attempts have been spent. The future then fails with
//!   [`ClientError::RetriesExhausted`] wrapping the last cause.
//! - A streaming operation that already handed out chunks is never resent;
//!   it fails with the transport error as is.
//! - Application errors and decoder failures are final on the first attempt.
//!
//! # Selection
//!
//! Untried healthy nodes are preferred, then untried unhealthy ones. Once
//! every node has been tried the whole set is eligible again.
//!
//! # Lifecycle
//!
//! `Created -> Running -> ShuttingDown -> Shutdown`. Only a running cluster
//! accepts work; anything submitted in another state fails with
//! [`ClientError::Shutdown`].
mod strategy;

use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error, info, warn};

use crate::{
    ClientError,
    config::{ClusterConfig, ConfigError, NodeAddress, NodeConfig, validate_options},
    future::{self, OperationFuture, StreamingFuture},
    lock,
    node::Node,
    operation::{Command, Operation, StreamChunk},
    protocol::{Frame, ThreadPool},
};

pub use strategy::{NodeSelector, RoundRobin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
}

struct Lifecycle {
    state: ClusterState,
    inflight: usize,
}

struct Inner {
    config: ClusterConfig,
    nodes: RwLock<Vec<Arc<Node>>>,
    selector: Box<dyn NodeSelector>,
    workers: ThreadPool,
    lifecycle: Mutex<Lifecycle>,
    drained: Condvar,
}

impl Inner {
    fn nodes(&self) -> RwLockReadGuard<'_, Vec<Arc<Node>>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn nodes_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<Node>>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, address: &NodeAddress) -> Option<Arc<Node>> {
        self.nodes().iter().find(|n| n.address() == address).cloned()
    }

    fn choose(&self, op: &Operation) -> Option<Arc<Node>> {
        let nodes = self.nodes().clone();
        if nodes.is_empty() {
            return None;
        }

        let tried = op.attempted();
        let untried: Vec<_> = nodes
            .iter()
            .filter(|n| !tried.contains(n.address()))
            .cloned()
            .collect();
        let eligible = if untried.is_empty() { nodes } else { untried };

        let healthy: Vec<_> = eligible.iter().filter(|n| n.is_healthy()).cloned().collect();
        let candidates = if healthy.is_empty() { eligible } else { healthy };

        self.selector.select(&candidates)
    }
}

/// Keeps a submitted operation counted as in flight until its last job ends.
struct Inflight {
    inner: Arc<Inner>,
}

impl Drop for Inflight {
    fn drop(&mut self) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.inflight = lifecycle.inflight.saturating_sub(1);
        if lifecycle.inflight == 0 {
            self.inner.drained.notify_all();
        }
    }
}

#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state())
            .field("nodes", &self.inner.nodes().len())
            .finish()
    }
}

impl Cluster {
    /// Builds a cluster with round-robin selection. No sockets are opened
    /// until [`start`](Self::start).
    pub fn new(config: ClusterConfig) -> Result<Self, ClientError> {
        Self::with_selector(config, RoundRobin::new())
    }

    pub fn with_selector<S: NodeSelector>(
        config: ClusterConfig,
        selector: S,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let nodes = config
            .nodes
            .iter()
            .map(|n| Arc::new(Node::new(n.address.clone(), n.options.clone())))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                workers: ThreadPool::new("kvlink-dispatch", config.io_threads),
                config,
                nodes: RwLock::new(nodes),
                selector: Box::new(selector),
                lifecycle: Mutex::new(Lifecycle {
                    state: ClusterState::Created,
                    inflight: 0,
                }),
                drained: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ClusterState {
        lock(&self.inner.lifecycle).state
    }

    /// Opens each node's minimum connections. An unreachable node is marked
    /// unhealthy and probed in the background; it does not fail the start.
    pub fn start(&self) -> Result<(), ClientError> {
        {
            let lifecycle = lock(&self.inner.lifecycle);
            match lifecycle.state {
                ClusterState::Created => {}
                ClusterState::Running => return Ok(()),
                _ => return Err(ClientError::Shutdown),
            }
        }

        let nodes = self.inner.nodes().clone();
        if nodes.is_empty() {
            return Err(ConfigError::NoNodes.into());
        }
        for node in &nodes {
            match node.start() {
                Ok(opened) => debug!("node {} warmed with {opened} connections", node.address()),
                Err(_) => debug!("node {} starts unhealthy", node.address()),
            }
        }

        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.state != ClusterState::Created {
            return Err(ClientError::Shutdown);
        }
        lifecycle.state = ClusterState::Running;
        info!(
            "cluster running with {} nodes, {} healthy",
            nodes.len(),
            nodes.iter().filter(|n| n.is_healthy()).count()
        );
        Ok(())
    }

    /// Dispatches `op`. Every outcome, including a refused submission, is
    /// reported through the operation's future.
    pub fn submit(&self, mut op: Operation) {
        let guard = match self.admit() {
            Ok(guard) => guard,
            Err(e) => {
                op.fail(e);
                return;
            }
        };
        op.mark_queued();

        if self.inner.workers.execute(move || dispatch(guard, op)).is_err() {
            warn!("worker pool closed; operation dropped");
        }
    }

    /// Sends `request` and decodes its single response frame.
    pub fn execute<T, D>(&self, request: Frame, decoder: D) -> OperationFuture<T>
    where
        T: Send + 'static,
        D: FnMut(Frame) -> Result<T, ClientError> + Send + 'static,
    {
        let (op, future) = Operation::single_shot(request, decoder);
        self.submit(op);
        future
    }

    /// Sends `request` and decodes response frames until the decoder marks
    /// one as the last.
    pub fn execute_streaming<C, D>(&self, request: Frame, decoder: D) -> StreamingFuture<C>
    where
        C: Send + 'static,
        D: FnMut(Frame) -> Result<StreamChunk<C>, ClientError> + Send + 'static,
    {
        let (op, future) = Operation::streaming(request, decoder);
        self.submit(op);
        future
    }

    pub fn execute_command<C: Command>(&self, command: C) -> OperationFuture<C::Output> {
        match Operation::from_command(command) {
            Ok((op, future)) => {
                self.submit(op);
                future
            }
            Err(e) => {
                let (promise, future) = future::promise();
                promise.fail(e);
                future
            }
        }
    }

    /// Runs `op` on the node at `address` only: no selection and no retry.
    pub fn execute_on(&self, address: &NodeAddress, mut op: Operation) {
        let guard = match self.admit() {
            Ok(guard) => guard,
            Err(e) => {
                op.fail(e);
                return;
            }
        };
        let Some(node) = self.inner.find(address) else {
            op.fail(ClientError::UnknownNode(address.to_string()));
            return;
        };
        op.mark_queued();

        let worker_node = Arc::clone(&node);
        let queued = node.spawn(move || {
            let _guard = guard;
            if op.is_done() {
                return;
            }
            if let Err(e) = worker_node.execute(&mut op) {
                debug!("pinned {op:?} on {} failed: {e}", worker_node.address());
                op.fail(e);
            }
        });
        if let Err(e) = queued {
            warn!("node {address} refused pinned operation: {e}");
        }
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.nodes().clone()
    }

    pub fn node(&self, address: &NodeAddress) -> Option<Arc<Node>> {
        self.inner.find(address)
    }

    /// Adds a node with the cluster's default options.
    pub fn add_node(&self, address: NodeAddress) -> Result<Arc<Node>, ClientError> {
        self.add_node_with(NodeConfig {
            address,
            options: self.inner.config.defaults.clone(),
        })
    }

    /// Adds a node, warming its pool if the cluster is running. Adding an
    /// address that is already a member returns the existing node.
    pub fn add_node_with(&self, config: NodeConfig) -> Result<Arc<Node>, ClientError> {
        validate_options(&config.address.to_string(), &config.options)?;
        if matches!(
            self.state(),
            ClusterState::ShuttingDown | ClusterState::Shutdown
        ) {
            return Err(ClientError::Shutdown);
        }

        let node = {
            let mut nodes = self.inner.nodes_mut();
            if let Some(existing) = nodes.iter().find(|n| n.address() == &config.address) {
                return Ok(Arc::clone(existing));
            }
            let node = Arc::new(Node::new(config.address, config.options));
            nodes.push(Arc::clone(&node));
            node
        };
        info!("node {} added", node.address());

        if self.state() == ClusterState::Running {
            match node.start() {
                Ok(opened) => debug!("node {} warmed with {opened} connections", node.address()),
                Err(_) => debug!("node {} joins unhealthy", node.address()),
            }
        }
        Ok(node)
    }

    /// Removes a node and drains its pool. Operations already running on it
    /// finish; new ones no longer select it.
    pub fn remove_node(&self, address: &NodeAddress) -> bool {
        let removed = {
            let mut nodes = self.inner.nodes_mut();
            nodes
                .iter()
                .position(|n| n.address() == address)
                .map(|i| nodes.remove(i))
        };
        match removed {
            Some(node) => {
                node.shutdown();
                info!("node {address} removed");
                true
            }
            None => false,
        }
    }

    /// Stops accepting work, waits for every in-flight operation to
    /// complete, fail or time out, then closes all connections.
    ///
    /// Must not be called from a future listener; listeners run on the
    /// threads this waits for.
    pub fn shutdown(&self) {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            match lifecycle.state {
                ClusterState::Shutdown => return,
                ClusterState::ShuttingDown => {}
                _ => {
                    info!("cluster shutting down");
                    lifecycle.state = ClusterState::ShuttingDown;
                }
            }
            while lifecycle.inflight > 0 {
                debug!("waiting for {} in-flight operations", lifecycle.inflight);
                lifecycle = self
                    .inner
                    .drained
                    .wait(lifecycle)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if lifecycle.state == ClusterState::Shutdown {
                return;
            }
            lifecycle.state = ClusterState::Shutdown;
        }

        for node in self.inner.nodes().iter() {
            node.shutdown();
        }
        self.inner.workers.shutdown();
        info!("cluster shut down");
    }

    fn admit(&self) -> Result<Inflight, ClientError> {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.state != ClusterState::Running {
            return Err(ClientError::Shutdown);
        }
        lifecycle.inflight += 1;
        Ok(Inflight {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Picks a node for the next attempt and queues it on that node's workers.
fn dispatch(guard: Inflight, mut op: Operation) {
    if op.is_done() {
        return;
    }

    let Some(node) = guard.inner.choose(&op) else {
        op.fail(ClientError::NoNodes);
        return;
    };

    let worker_node = Arc::clone(&node);
    if let Err(e) = node.spawn(move || attempt(guard, worker_node, op)) {
        warn!("node {} refused operation: {e}", node.address());
    }
}

/// One attempt. Queues the next dispatch as a new job when a retry is due.
fn attempt(guard: Inflight, node: Arc<Node>, mut op: Operation) {
    if op.is_done() {
        return;
    }

    let inner = Arc::clone(&guard.inner);
    let err = match node.execute(&mut op) {
        Ok(()) => return,
        Err(e) => e,
    };

    if !err.is_retryable() {
        debug!("{op:?} failed on {}: {err}", node.address());
        op.fail(err);
        return;
    }

    if op.is_streaming() && op.delivered() > 0 {
        warn!(
            "{op:?} failed on {} after {} chunks; not resending: {err}",
            node.address(),
            op.delivered()
        );
        op.fail(err);
        return;
    }

    if op.retries() < inner.config.retry_count {
        warn!(
            "attempt {} of {op:?} on {} failed: {err}",
            op.attempted().len(),
            node.address()
        );
        op.record_retry(err);
        if inner.workers.execute(move || dispatch(guard, op)).is_err() {
            warn!("worker pool closed; retry dropped");
        }
        return;
    }

    let attempts = op.attempted().len() as u32;
    error!("{op:?} giving up after {attempts} attempts: {err}");
    op.fail(ClientError::RetriesExhausted {
        attempts,
        last: Box::new(err),
    });
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpListener,
        thread,
        time::{Duration, Instant},
    };

    use crate::{
        operation::Ping,
        protocol::{
            DEFAULT_MAX_FRAME_SIZE, ErrorResponse, FrameServer, PING_REQUEST, PING_RESPONSE,
            Reply, ServerHandle, StubHandler,
        },
    };

    use super::*;

    fn serve<H: crate::protocol::FrameHandler>(handler: H) -> ServerHandle {
        FrameServer::bind("127.0.0.1:0", handler, 8)
            .unwrap()
            .spawn()
            .unwrap()
    }

    fn stub() -> ServerHandle {
        serve(StubHandler {
            address: NodeAddress::new("127.0.0.1", 0),
        })
    }

    /// An address nothing listens on.
    fn dead_address() -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().into();
        drop(listener);
        address
    }

    fn cluster(addresses: Vec<NodeAddress>, retries: u32) -> Cluster {
        let config = ClusterConfig::new(addresses)
            .with_retry_count(retries)
            .with_node_options(|o| {
                o.min_connections = 0;
                o.connect_timeout = Duration::from_millis(500);
                o.request_timeout = Duration::from_secs(2);
                o.probe_interval = Duration::from_secs(60);
            });
        let cluster = Cluster::new(config).unwrap();
        cluster.start().unwrap();
        cluster
    }

    fn ping_op() -> (Operation, OperationFuture<()>) {
        Operation::from_command(Ping).unwrap()
    }

    #[test]
    fn executes_ping() {
        let server = stub();
        let cluster = cluster(vec![server.node_address()], 2);

        for _ in 0..10 {
            cluster.execute_command(Ping).wait().unwrap();
        }
        assert_eq!(server.requests(), 10);
        cluster.shutdown();
        server.stop();
    }

    #[test]
    fn retries_exhausted_after_distinct_nodes() {
        let cluster = cluster(vec![dead_address(), dead_address(), dead_address()], 2);

        let (op, future) = ping_op();
        let (tx, rx) = std::sync::mpsc::channel();
        future.add_listener(move |result| {
            tx.send(matches!(result, Err(ClientError::RetriesExhausted { attempts: 3, .. })))
                .unwrap();
        });
        cluster.submit(op);

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        match future.wait() {
            Err(ClientError::RetriesExhausted { last, .. }) => {
                assert!(matches!(*last, ClientError::Connect { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
        cluster.shutdown();
    }

    #[test]
    fn attempts_hit_every_node_once() {
        let addresses = vec![dead_address(), dead_address(), dead_address()];
        let cluster = cluster(addresses.clone(), 2);

        let (op, future) = ping_op();
        cluster.submit(op);
        let err = future.wait().unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 3, .. }));
        assert!(matches!(err.root(), ClientError::Connect { .. }));

        for address in &addresses {
            let node = cluster.node(address).unwrap();
            assert!(node.consecutive_failures() >= 1);
        }
        cluster.shutdown();
    }

    #[test]
    fn hops_past_refusing_nodes() {
        let dead = vec![dead_address(), dead_address()];
        let server = stub();
        let mut addresses = dead.clone();
        addresses.push(server.node_address());
        let cluster = cluster(addresses, 2);

        // Refused connects only ever add to the dead nodes' counters.
        let refused = || {
            dead.iter()
                .map(|a| cluster.node(a).unwrap().consecutive_failures())
                .sum::<u32>()
        };
        for sent in 1..=6 {
            let before = refused();
            cluster.execute_command(Ping).wait().unwrap();
            assert!(refused() - before <= 2);
            assert_eq!(server.requests(), sent);
        }
        cluster.shutdown();
        server.stop();
    }

    #[test]
    fn no_retry_budget() {
        let cluster = cluster(vec![dead_address(), dead_address()], 0);
        let err = cluster.execute_command(Ping).wait().unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 1, .. }));
        cluster.shutdown();
    }

    #[test]
    fn half_frame_then_close_retries_elsewhere() {
        let full = Frame::empty(PING_RESPONSE)
            .encode(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let half = full[..3].to_vec();
        let broken = serve(move |_: Frame| Reply::RawThenClose(half.clone()));
        let good = stub();
        let cluster = cluster(vec![broken.node_address(), good.node_address()], 1);

        for _ in 0..4 {
            cluster.execute_command(Ping).wait().unwrap();
        }
        assert!(broken.requests() >= 1);
        assert_eq!(good.requests(), 4);

        let node = cluster.node(&broken.node_address()).unwrap();
        assert_eq!(node.pool().stats().idle, 0);
        cluster.shutdown();
        broken.stop();
        good.stop();
    }

    #[test]
    fn application_error_not_retried() {
        let a = serve(|_: Frame| Reply::frame(ErrorResponse::new(3, "bad key").into_frame().unwrap()));
        let b = serve(|_: Frame| Reply::frame(ErrorResponse::new(3, "bad key").into_frame().unwrap()));
        let cluster = cluster(vec![a.node_address(), b.node_address()], 2);

        let err = cluster
            .execute(Frame::empty(60), |_| Ok(()))
            .wait()
            .unwrap_err();
        assert!(matches!(err, ClientError::Application { code: 3, .. }));
        assert_eq!(a.requests() + b.requests(), 1);
        cluster.shutdown();
        a.stop();
        b.stop();
    }

    #[test]
    fn streams_in_order() {
        let server = serve(|_: Frame| {
            Reply::Frames(vec![
                Frame::new(71, b"A".to_vec()),
                Frame::new(71, b"B".to_vec()),
                Frame::new(71, b"C".to_vec()),
                Frame::empty(72),
            ])
        });
        let cluster = cluster(vec![server.node_address()], 2);

        let future = cluster.execute_streaming(Frame::empty(70), |frame| match frame.code {
            72 => Ok(StreamChunk::done(vec![])),
            _ => Ok(StreamChunk::more(vec![frame.payload[0] as char])),
        });
        let (chunks, status) = future.collect_all();
        assert_eq!(chunks, vec!['A', 'B', 'C']);
        status.unwrap();
        cluster.shutdown();
        server.stop();
    }

    #[test]
    fn stream_with_chunks_is_not_resent() {
        let chunk = Frame::new(71, b"A".to_vec())
            .encode(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let a = serve({
            let chunk = chunk.clone();
            move |_: Frame| Reply::RawThenClose(chunk.clone())
        });
        let b = serve(move |_: Frame| Reply::RawThenClose(chunk.clone()));
        let cluster = cluster(vec![a.node_address(), b.node_address()], 2);

        let future = cluster.execute_streaming(Frame::empty(70), |frame| {
            Ok(StreamChunk::more(vec![frame.payload]))
        });
        let (chunks, status) = future.collect_all();
        assert_eq!(chunks, vec![b"A".to_vec()]);
        assert!(matches!(status, Err(ClientError::Io(_))));
        assert_eq!(a.requests() + b.requests(), 1);
        cluster.shutdown();
        a.stop();
        b.stop();
    }

    #[test]
    fn unhealthy_node_skipped() {
        let down = serve(|_: Frame| Reply::Close);
        let up = stub();
        let config = ClusterConfig::new(vec![down.node_address(), up.node_address()])
            .with_retry_count(1)
            .with_node_options(|o| {
                o.min_connections = 0;
                o.failure_threshold = 1;
                o.probe_interval = Duration::from_secs(60);
            });
        let cluster = Cluster::new(config).unwrap();
        cluster.start().unwrap();

        for _ in 0..4 {
            cluster.execute_command(Ping).wait().unwrap();
        }
        assert!(down.requests() <= 1);
        assert_eq!(up.requests(), 4);
        assert!(!cluster.node(&down.node_address()).unwrap().is_healthy());
        cluster.shutdown();
        down.stop();
        up.stop();
    }

    #[test]
    fn timeout_surfaces_as_cause() {
        let server = serve(|_: Frame| Reply::Silent);
        let cluster = cluster(vec![server.node_address()], 0);

        let (op, future) = ping_op();
        cluster.submit(op.with_timeout(Some(Duration::from_millis(100))));
        let err = future.wait().unwrap_err();
        assert!(matches!(err.root(), ClientError::Timeout(_)));
        cluster.shutdown();
        server.stop();
    }

    #[test]
    fn cancel_in_flight() {
        let server = serve(|_: Frame| Reply::Silent);
        let cluster = cluster(vec![server.node_address()], 2);

        let future = cluster.execute_command(Ping);
        while server.requests() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(future.cancel());
        assert!(matches!(future.wait(), Err(ClientError::Cancelled)));

        let started = Instant::now();
        cluster.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(server.requests(), 1);
        server.stop();
    }

    #[test]
    fn stalled_node_does_not_hold_up_others() {
        let silent = serve(|_: Frame| Reply::Silent);
        let up = stub();
        let mut config = ClusterConfig::new(vec![silent.node_address(), up.node_address()])
            .with_node_options(|o| {
                o.min_connections = 0;
                o.request_timeout = Duration::from_secs(2);
                o.probe_interval = Duration::from_secs(60);
            });
        config.io_threads = 2;
        let cluster = Cluster::new(config).unwrap();
        cluster.start().unwrap();

        let stalled: Vec<_> = (0..2)
            .map(|_| {
                let (op, future) = ping_op();
                cluster.execute_on(&silent.node_address(), op);
                future
            })
            .collect();
        while silent.requests() < 2 {
            thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        let (op, future) = ping_op();
        cluster.execute_on(&up.node_address(), op);
        future.wait().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        for future in stalled {
            assert!(matches!(future.wait(), Err(ClientError::Timeout(_))));
        }
        cluster.shutdown();
        silent.stop();
        up.stop();
    }

    #[test]
    fn rejects_outside_running() {
        let server = stub();
        let config = ClusterConfig::new(vec![server.node_address()]);
        let cluster = Cluster::new(config).unwrap();
        assert_eq!(cluster.state(), ClusterState::Created);
        assert!(matches!(
            cluster.execute_command(Ping).wait(),
            Err(ClientError::Shutdown)
        ));

        cluster.start().unwrap();
        cluster.shutdown();
        assert_eq!(cluster.state(), ClusterState::Shutdown);
        assert!(matches!(
            cluster.execute_command(Ping).wait(),
            Err(ClientError::Shutdown)
        ));
        assert!(matches!(cluster.start(), Err(ClientError::Shutdown)));
        server.stop();
    }

    #[test]
    fn shutdown_waits_for_in_flight() {
        let server = serve(|req: Frame| match req.code {
            PING_REQUEST => Reply::After(
                Duration::from_millis(200),
                Box::new(Reply::frame(Frame::empty(PING_RESPONSE))),
            ),
            _ => Reply::Close,
        });
        let cluster = cluster(vec![server.node_address()], 0);

        let future = cluster.execute_command(Ping);
        while server.requests() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        cluster.shutdown();
        assert!(future.is_done());
        future.wait().unwrap();

        let node = cluster.nodes().remove(0);
        assert_eq!(node.pool().stats().open, 0);
        server.stop();
    }

    #[test]
    fn empty_cluster_fails_to_start() {
        let cluster = Cluster::new(ClusterConfig::default()).unwrap();
        assert!(matches!(
            cluster.start(),
            Err(ClientError::Config(ConfigError::NoNodes))
        ));
    }

    #[test]
    fn membership_changes() {
        let a = stub();
        let b = stub();
        let cluster = cluster(vec![a.node_address()], 0);

        cluster.add_node(b.node_address()).unwrap();
        cluster.add_node(b.node_address()).unwrap();
        assert_eq!(cluster.nodes().len(), 2);

        assert!(cluster.remove_node(&a.node_address()));
        assert!(!cluster.remove_node(&a.node_address()));
        for _ in 0..3 {
            cluster.execute_command(Ping).wait().unwrap();
        }
        assert_eq!(b.requests(), 3);
        cluster.shutdown();
        a.stop();
        b.stop();
    }

    #[test]
    fn pinned_execution() {
        let a = stub();
        let b = stub();
        let cluster = cluster(vec![a.node_address(), b.node_address()], 2);

        for _ in 0..3 {
            let (op, future) = ping_op();
            cluster.execute_on(&b.node_address(), op);
            future.wait().unwrap();
        }
        assert_eq!(a.requests(), 0);
        assert_eq!(b.requests(), 3);

        let (op, future) = ping_op();
        cluster.execute_on(&dead_address(), op);
        assert!(matches!(future.wait(), Err(ClientError::UnknownNode(_))));
        cluster.shutdown();
        a.stop();
        b.stop();
    }

    #[test]
    fn pinned_failure_is_not_retried() {
        let dead = dead_address();
        let server = stub();
        let cluster = cluster(vec![dead.clone(), server.node_address()], 2);

        let (op, future) = ping_op();
        cluster.execute_on(&dead, op);
        assert!(matches!(future.wait(), Err(ClientError::Connect { .. })));
        assert_eq!(server.requests(), 0);
        cluster.shutdown();
        server.stop();
    }
}
