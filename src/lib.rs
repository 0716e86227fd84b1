//! Fault-tolerant client engine for a clustered key/value and time-series
//! store.
//!
//! Requests travel as length-prefixed frames over pooled TCP connections.
//! A [`Cluster`] routes each [`Operation`] to a healthy node, hops to another
//! node when the transport fails, and reports the outcome through an
//! [`OperationFuture`] or, for multi-frame replies, a [`StreamingFuture`].
pub mod cluster;
pub mod config;
pub mod connection;
pub mod coverage;
pub mod error;
pub mod future;
pub mod node;
pub mod operation;
pub mod pool;
pub mod protocol;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cluster::{Cluster, ClusterState, NodeSelector, RoundRobin};
pub use config::{ClusterConfig, ConfigError, NodeAddress, NodeConfig, NodeOptions};
pub use connection::Connection;
pub use coverage::{CoverageEntry, CoveragePlan, CoverageQuery, CoverageRouter, PartitionRange};
pub use error::ClientError;
pub use future::{OperationFuture, Promise, StreamingFuture};
pub use node::{Health, HealthCheck, Node, PingHealthCheck};
pub use operation::{Command, Operation, OperationKind, Ping, StreamChunk};
pub use pool::{ConnectionPool, PoolStats};
pub use protocol::{CoverageRequest, Frame};

/// Locks `m`, carrying on with the data if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
