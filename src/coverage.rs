//! Partition-aware scatter/gather.
//!
//! A coverage plan maps each partition of a query to the node that owns it,
//! with an opaque context the node uses to scope the sub-query. The router
//! asks the cluster for a plan, then sends one streaming sub-operation per
//! entry straight to the entry's node. Entries succeed or fail on their own;
//! a rejected context comes back as [`ClientError::StalePlan`] and nothing is
//! re-planned automatically.
use std::sync::Arc;

use bincode::{Decode, Encode};
use log::debug;

use crate::{
    ClientError,
    cluster::Cluster,
    config::NodeAddress,
    future::{self, OperationFuture, StreamingFuture},
    operation::{Operation, StreamChunk},
    protocol::{COVERAGE_RESPONSE, CoverageRequest, Frame, decode_payload, encode_payload},
};

/// Range of a partition key, e.g. a time window.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct PartitionRange {
    pub field: String,
    pub lower: i64,
    pub lower_inclusive: bool,
    pub upper: i64,
    pub upper_inclusive: bool,
    pub description: String,
}

impl PartitionRange {
    /// `[lower, upper)` over `field`.
    pub fn new(field: impl Into<String>, lower: i64, upper: i64) -> Self {
        let field = field.into();
        Self {
            description: format!("{field} [{lower}, {upper})"),
            field,
            lower,
            lower_inclusive: true,
            upper,
            upper_inclusive: false,
        }
    }

    pub fn unbounded(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            description: format!("{field} (all)"),
            field,
            lower: i64::MIN,
            lower_inclusive: true,
            upper: i64::MAX,
            upper_inclusive: true,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        let above = if self.lower_inclusive {
            value >= self.lower
        } else {
            value > self.lower
        };
        let below = if self.upper_inclusive {
            value <= self.upper
        } else {
            value < self.upper
        };
        above && below
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct CoverageEntry {
    pub range: PartitionRange,
    pub host: String,
    pub port: u16,
    /// Opaque to the client; echoed back to the node.
    pub context: Vec<u8>,
}

impl CoverageEntry {
    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoveragePlan {
    pub entries: Vec<CoverageEntry>,
}

impl CoveragePlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct nodes named by the plan, in first-seen order.
    pub fn nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = Vec::new();
        for entry in &self.entries {
            let address = entry.address();
            if !nodes.contains(&address) {
                nodes.push(address);
            }
        }
        nodes
    }
}

pub fn encode_plan(entries: &[CoverageEntry]) -> Result<Frame, ClientError> {
    Ok(Frame::new(COVERAGE_RESPONSE, encode_payload(entries)?))
}

/// Decoder for planning replies.
pub fn decode_plan(frame: Frame) -> Result<CoveragePlan, ClientError> {
    if frame.code != COVERAGE_RESPONSE {
        return Err(ClientError::UnexpectedData(format!(
            "expected coverage plan, got opcode {}",
            frame.code
        )));
    }
    let entries: Vec<CoverageEntry> = decode_payload(&frame.payload)?;
    Ok(CoveragePlan { entries })
}

/// How to query one partition and read its answer.
pub trait CoverageQuery: Send + Sync + 'static {
    type Chunk: Send + 'static;

    /// Builds the sub-request for `entry`, normally embedding its context.
    fn request(&self, entry: &CoverageEntry) -> Result<Frame, ClientError>;

    fn decode(&self, frame: Frame) -> Result<StreamChunk<Self::Chunk>, ClientError>;
}

/// The outcome of one plan entry.
pub struct EntryResult<C> {
    pub entry: CoverageEntry,
    pub future: StreamingFuture<C>,
}

/// Per-entry results in plan order.
pub struct CoverageResults<C> {
    results: Vec<EntryResult<C>>,
}

impl<C> CoverageResults<C> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Concatenates every entry's chunks in plan order. Failed entries are
    /// returned beside the data; their partial chunks are kept.
    pub fn merge(self) -> (Vec<C>, Vec<(CoverageEntry, ClientError)>) {
        let mut chunks = Vec::new();
        let mut failures = Vec::new();
        for EntryResult { entry, future } in self.results {
            let (mut items, status) = future.collect_all();
            chunks.append(&mut items);
            if let Err(e) = status {
                failures.push((entry, e));
            }
        }
        (chunks, failures)
    }
}

impl<C> IntoIterator for CoverageResults<C> {
    type Item = EntryResult<C>;
    type IntoIter = std::vec::IntoIter<EntryResult<C>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

pub struct CoverageRouter {
    cluster: Cluster,
}

impl CoverageRouter {
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }

    /// Asks any node for a fresh plan. Plans are never cached.
    pub fn plan(&self, request: CoverageRequest) -> OperationFuture<CoveragePlan> {
        match request.into_frame() {
            Ok(frame) => self.cluster.execute(frame, decode_plan),
            Err(e) => {
                let (promise, future) = future::promise();
                promise.fail(e);
                future
            }
        }
    }

    /// Asks for a replacement for `stale`, typically after its node
    /// answered with [`ClientError::StalePlan`].
    pub fn replan(
        &self,
        mut request: CoverageRequest,
        stale: &CoverageEntry,
    ) -> OperationFuture<CoveragePlan> {
        debug!("re-planning coverage entry {}", stale.range.description);
        request.replace_context = Some(stale.context.clone());
        self.plan(request)
    }

    /// Sends `query` to every entry's node, bypassing selection and retry.
    pub fn execute<Q: CoverageQuery>(
        &self,
        plan: &CoveragePlan,
        query: Q,
    ) -> CoverageResults<Q::Chunk> {
        let query = Arc::new(query);
        let results = plan
            .entries
            .iter()
            .map(|entry| EntryResult {
                entry: entry.clone(),
                future: self.dispatch(entry, &query),
            })
            .collect();
        CoverageResults { results }
    }

    fn dispatch<Q: CoverageQuery>(
        &self,
        entry: &CoverageEntry,
        query: &Arc<Q>,
    ) -> StreamingFuture<Q::Chunk> {
        let request = match query.request(entry) {
            Ok(request) => request,
            Err(e) => {
                let (promise, future) = future::stream();
                promise.fail(e);
                return future;
            }
        };

        let address = entry.address();
        debug!("coverage entry {} -> {address}", entry.range.description);
        let decoder = Arc::clone(query);
        let (op, future) = Operation::streaming(request, move |frame| decoder.decode(frame));
        self.cluster
            .execute_on(&address, op.with_coverage_target(address.clone()));
        future
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpListener,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use crate::{
        config::ClusterConfig,
        protocol::{
            COVERAGE_REQUEST, ErrorResponse, FrameServer, Reply, STALE_COVERAGE_CODE,
            ServerHandle,
        },
    };

    use super::*;

    const QUERY: u8 = 110;
    const ROWS: u8 = 111;
    const END: u8 = 112;

    /// Answers planning requests from `plan` and sub-queries by echoing the
    /// context as one row.
    fn node(plan: Arc<Mutex<Vec<CoverageEntry>>>, stale: bool) -> ServerHandle {
        FrameServer::bind(
            "127.0.0.1:0",
            move |req: Frame| match req.code {
                COVERAGE_REQUEST => Reply::frame(encode_plan(&plan.lock().unwrap()).unwrap()),
                QUERY if stale => Reply::frame(
                    ErrorResponse::new(STALE_COVERAGE_CODE, "partition moved")
                        .into_frame()
                        .unwrap(),
                ),
                QUERY => Reply::Frames(vec![Frame::new(ROWS, req.payload), Frame::empty(END)]),
                _ => Reply::Close,
            },
            4,
        )
        .unwrap()
        .spawn()
        .unwrap()
    }

    fn entry(address: &NodeAddress, range: PartitionRange, context: &str) -> CoverageEntry {
        CoverageEntry {
            range,
            host: address.host.clone(),
            port: address.port,
            context: context.as_bytes().to_vec(),
        }
    }

    struct EchoQuery;

    impl CoverageQuery for EchoQuery {
        type Chunk = String;

        fn request(&self, entry: &CoverageEntry) -> Result<Frame, ClientError> {
            Ok(Frame::new(QUERY, entry.context.clone()))
        }

        fn decode(&self, frame: Frame) -> Result<StreamChunk<String>, ClientError> {
            match frame.code {
                END => Ok(StreamChunk::done(vec![])),
                ROWS => Ok(StreamChunk::more(vec![
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                ])),
                other => Err(ClientError::UnexpectedData(format!("opcode {other}"))),
            }
        }
    }

    fn start(nodes: &[&ServerHandle]) -> Cluster {
        let config = ClusterConfig::new(nodes.iter().map(|n| n.node_address()))
            .with_node_options(|o| {
                o.min_connections = 0;
                o.request_timeout = Duration::from_secs(2);
            });
        let cluster = Cluster::new(config).unwrap();
        cluster.start().unwrap();
        cluster
    }

    fn request() -> CoverageRequest {
        CoverageRequest {
            table: "metrics".into(),
            query: "select * where time > 0".into(),
            replace_context: None,
        }
    }

    #[test]
    fn plan_then_scatter() {
        let plan = Arc::new(Mutex::new(Vec::new()));
        let a = node(Arc::clone(&plan), false);
        let b = node(Arc::clone(&plan), false);
        *plan.lock().unwrap() = vec![
            entry(&a.node_address(), PartitionRange::new("time", 0, 100), "p0"),
            entry(&b.node_address(), PartitionRange::new("time", 100, 200), "p1"),
            entry(&a.node_address(), PartitionRange::new("time", 200, 300), "p2"),
        ];

        let cluster = start(&[&a, &b]);
        let router = CoverageRouter::new(cluster.clone());
        let plan = router.plan(request()).wait().unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.nodes(), vec![a.node_address(), b.node_address()]);

        let (rows, failures) = router.execute(&plan, EchoQuery).merge();
        assert_eq!(rows, vec!["p0", "p1", "p2"]);
        assert!(failures.is_empty());
        assert_eq!(a.requests() + b.requests(), 4);

        cluster.shutdown();
        a.stop();
        b.stop();
    }

    #[test]
    fn replan_sends_stale_context() {
        let server = FrameServer::bind(
            "127.0.0.1:0",
            |req: Frame| {
                let request: CoverageRequest = decode_payload(&req.payload).unwrap();
                let context = match request.replace_context {
                    Some(old) => [b"fresh-".as_slice(), old.as_slice()].concat(),
                    None => b"first".to_vec(),
                };
                let entry = CoverageEntry {
                    range: PartitionRange::new("time", 0, 10),
                    host: "db-9".into(),
                    port: 8087,
                    context,
                };
                Reply::frame(encode_plan(&[entry]).unwrap())
            },
            4,
        )
        .unwrap()
        .spawn()
        .unwrap();
        let cluster = start(&[&server]);
        let router = CoverageRouter::new(cluster.clone());

        let plan = router.plan(request()).wait().unwrap();
        assert_eq!(plan.entries[0].context, b"first");
        let replacement = router.replan(request(), &plan.entries[0]).wait().unwrap();
        assert_eq!(replacement.entries[0].context, b"fresh-first");
        assert_eq!(replacement.entries[0].range, plan.entries[0].range);

        cluster.shutdown();
        server.stop();
    }

    #[test]
    fn entries_fail_independently() {
        let plan = Arc::new(Mutex::new(Vec::new()));
        let good = node(Arc::clone(&plan), false);
        let stale = node(Arc::clone(&plan), true);
        let cluster = start(&[&good, &stale]);

        let plan = CoveragePlan {
            entries: vec![
                entry(&good.node_address(), PartitionRange::new("time", 0, 10), "ok"),
                entry(&stale.node_address(), PartitionRange::new("time", 10, 20), "old"),
            ],
        };
        let mut results = CoverageRouter::new(cluster.clone())
            .execute(&plan, EchoQuery)
            .into_iter();
        let first = results.next().unwrap();
        let (rows, status) = first.future.collect_all();
        assert_eq!(rows, vec!["ok"]);
        status.unwrap();

        let second = results.next().unwrap();
        match second.future.wait() {
            Err(ClientError::StalePlan { address, .. }) => {
                assert_eq!(address, stale.node_address().to_string())
            }
            other => panic!("unexpected {other:?}"),
        }

        cluster.shutdown();
        good.stop();
        stale.stop();
    }

    #[test]
    fn entry_outside_cluster() {
        let plan = Arc::new(Mutex::new(Vec::new()));
        let a = node(plan, false);
        let cluster = start(&[&a]);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stranger: NodeAddress = listener.local_addr().unwrap().into();
        let plan = CoveragePlan {
            entries: vec![
                entry(&stranger, PartitionRange::unbounded("time"), "x"),
                entry(&a.node_address(), PartitionRange::unbounded("time"), "y"),
            ],
        };

        let (rows, failures) = CoverageRouter::new(cluster.clone())
            .execute(&plan, EchoQuery)
            .merge();
        assert_eq!(rows, vec!["y"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.address(), stranger);
        assert!(matches!(failures[0].1, ClientError::UnknownNode(_)));
        assert!(cluster.node(&stranger).is_none());

        cluster.shutdown();
        a.stop();
    }

    #[test]
    fn plan_rejects_other_opcodes() {
        assert!(matches!(
            decode_plan(Frame::empty(3)),
            Err(ClientError::UnexpectedData(_))
        ));
    }

    #[test]
    fn plan_round_trip() {
        let entries = vec![entry(
            &NodeAddress::new("db-1", 8087),
            PartitionRange::new("time", -5, 5),
            "ctx",
        )];
        let plan = decode_plan(encode_plan(&entries).unwrap()).unwrap();
        assert_eq!(plan.entries, entries);
    }

    #[test]
    fn range_bounds() {
        let range = PartitionRange::new("time", 0, 10);
        assert!(range.contains(0));
        assert!(range.contains(9));
        assert!(!range.contains(10));
        assert!(!range.contains(-1));
        assert!(PartitionRange::unbounded("time").contains(i64::MAX));
    }
}
