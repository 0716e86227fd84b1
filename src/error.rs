use std::{io, time::Duration};

use thiserror::Error;

use crate::{config::ConfigError, protocol::FrameError};

/// Every way an operation can fail. A failed future carries exactly one.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error("no terminal frame within {0:?}")]
    Timeout(Duration),

    #[error("unexpected data on connection: {0}")]
    UnexpectedData(String),

    #[error("connection pool for {0} is exhausted")]
    PoolExhausted(String),

    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ClientError> },

    #[error("server error {code}: {message}")]
    Application { code: u32, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("coverage context rejected by {address}: {message}")]
    StalePlan { address: String, message: String },

    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("failed to encode payload: {0}")]
    Serialize(#[from] bincode::error::EncodeError),

    #[error("failed to decode payload: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("no nodes available")]
    NoNodes,

    #[error("{0} is not a member of the cluster")]
    UnknownNode(String),

    #[error("cluster is shut down")]
    Shutdown,
}

impl ClientError {
    /// Transport-level failures the dispatcher answers by trying another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Io(_)
                | ClientError::Timeout(_)
                | ClientError::PoolExhausted(_)
        )
    }

    /// Failures that count against a node's health.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::Io(_) | ClientError::Timeout(_)
        )
    }

    /// The innermost cause, looking through `RetriesExhausted`.
    pub fn root(&self) -> &ClientError {
        match self {
            ClientError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}
