//! The unit of work submitted to a cluster.
//!
//! An [`Operation`] bundles an encoded request frame with the decoder that
//! turns response frames into a typed result, and with the promise that
//! completes the caller's future. Whether it is single-shot or streaming is
//! fixed when it is built and never inferred later.
use std::time::{Duration, Instant};

use crate::{
    ClientError,
    config::NodeAddress,
    future::{self, CancelHook, OperationFuture, Promise, StreamingFuture},
    protocol::{Frame, STALE_COVERAGE_CODE, error_from_frame, expect_pong, ping},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// One response frame, decoded once.
    SingleShot,
    /// Response frames decoded one by one until the decoder sees the last.
    Streaming,
}

/// Whether the operation needs more frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Complete,
}

/// Items decoded from one streaming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk<C> {
    pub items: Vec<C>,
    /// Set on the terminal frame.
    pub done: bool,
}

impl<C> StreamChunk<C> {
    pub fn more(items: Vec<C>) -> Self {
        Self { items, done: false }
    }

    pub fn done(items: Vec<C>) -> Self {
        Self { items, done: true }
    }
}

/// A typed request that knows how to decode its own response.
pub trait Command: Send + 'static {
    type Output: Send + 'static;

    fn request(&self) -> Result<Frame, ClientError>;

    fn decode(&mut self, frame: Frame) -> Result<Self::Output, ClientError>;

    /// Overrides the node's default request timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Round-trips an empty frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ping;

impl Command for Ping {
    type Output = ();

    fn request(&self) -> Result<Frame, ClientError> {
        Ok(ping())
    }

    fn decode(&mut self, frame: Frame) -> Result<(), ClientError> {
        expect_pong(frame)
    }
}

trait ResponseSink: Send {
    fn on_frame(&mut self, frame: Frame) -> Progress;
    fn fail(&mut self, err: ClientError) -> bool;
    fn is_done(&self) -> bool;
    fn is_cancelled(&self) -> bool;
    fn delivered(&self) -> usize;
    fn set_cancel_hook(&self, hook: CancelHook) -> bool;
    fn clear_cancel_hook(&self);
}

type Decoder<T> = Box<dyn FnMut(Frame) -> Result<T, ClientError> + Send>;

struct SingleShotSink<T> {
    decoder: Decoder<T>,
    promise: Promise<T>,
}

impl<T: Send> ResponseSink for SingleShotSink<T> {
    fn on_frame(&mut self, frame: Frame) -> Progress {
        match (self.decoder)(frame) {
            Ok(value) => self.promise.succeed(value),
            Err(e) => self.promise.fail(e),
        };
        Progress::Complete
    }

    fn fail(&mut self, err: ClientError) -> bool {
        self.promise.fail(err)
    }

    fn is_done(&self) -> bool {
        self.promise.is_done()
    }

    fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }

    fn delivered(&self) -> usize {
        0
    }

    fn set_cancel_hook(&self, hook: CancelHook) -> bool {
        self.promise.set_cancel_hook(hook)
    }

    fn clear_cancel_hook(&self) {
        self.promise.clear_cancel_hook()
    }
}

struct StreamingSink<C> {
    decoder: Decoder<StreamChunk<C>>,
    promise: Promise<(), C>,
}

impl<C: Send> ResponseSink for StreamingSink<C> {
    fn on_frame(&mut self, frame: Frame) -> Progress {
        match (self.decoder)(frame) {
            Ok(chunk) => {
                for item in chunk.items {
                    self.promise.push(item);
                }
                if chunk.done {
                    self.promise.succeed(());
                    Progress::Complete
                } else {
                    Progress::Continue
                }
            }
            Err(e) => {
                self.promise.fail(e);
                Progress::Complete
            }
        }
    }

    fn fail(&mut self, err: ClientError) -> bool {
        self.promise.fail(err)
    }

    fn is_done(&self) -> bool {
        self.promise.is_done()
    }

    fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }

    fn delivered(&self) -> usize {
        self.promise.delivered()
    }

    fn set_cancel_hook(&self, hook: CancelHook) -> bool {
        self.promise.set_cancel_hook(hook)
    }

    fn clear_cancel_hook(&self) {
        self.promise.clear_cancel_hook()
    }
}

pub struct Operation {
    request: Frame,
    kind: OperationKind,
    timeout: Option<Duration>,
    queued_at: Instant,
    retries: u32,
    attempted: Vec<NodeAddress>,
    last_error: Option<ClientError>,
    coverage_target: Option<NodeAddress>,
    sink: Box<dyn ResponseSink>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("code", &self.request.code)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("attempted", &self.attempted)
            .finish()
    }
}

impl Operation {
    pub fn single_shot<T, D>(request: Frame, decoder: D) -> (Self, OperationFuture<T>)
    where
        T: Send + 'static,
        D: FnMut(Frame) -> Result<T, ClientError> + Send + 'static,
    {
        let (promise, future) = future::promise();
        let sink = SingleShotSink {
            decoder: Box::new(decoder),
            promise,
        };
        (Self::new(request, OperationKind::SingleShot, Box::new(sink)), future)
    }

    pub fn streaming<C, D>(request: Frame, decoder: D) -> (Self, StreamingFuture<C>)
    where
        C: Send + 'static,
        D: FnMut(Frame) -> Result<StreamChunk<C>, ClientError> + Send + 'static,
    {
        let (promise, future) = future::stream();
        let sink = StreamingSink {
            decoder: Box::new(decoder),
            promise,
        };
        (Self::new(request, OperationKind::Streaming, Box::new(sink)), future)
    }

    pub fn from_command<C: Command>(
        mut command: C,
    ) -> Result<(Self, OperationFuture<C::Output>), ClientError> {
        let request = command.request()?;
        let timeout = command.timeout();
        let (op, future) = Self::single_shot(request, move |frame| command.decode(frame));
        Ok((op.with_timeout(timeout), future))
    }

    fn new(request: Frame, kind: OperationKind, sink: Box<dyn ResponseSink>) -> Self {
        Self {
            request,
            kind,
            timeout: None,
            queued_at: Instant::now(),
            retries: 0,
            attempted: Vec::new(),
            last_error: None,
            coverage_target: None,
            sink,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks this as a coverage sub-operation for `target`, so a rejected
    /// coverage context surfaces as [`ClientError::StalePlan`].
    pub(crate) fn with_coverage_target(mut self, target: NodeAddress) -> Self {
        self.coverage_target = Some(target);
        self
    }

    pub fn request(&self) -> &Frame {
        &self.request
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_streaming(&self) -> bool {
        self.kind == OperationKind::Streaming
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// When the current attempt was queued. Its deadline counts from here.
    pub fn queued_at(&self) -> Instant {
        self.queued_at
    }

    /// Number of retries already spent.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Nodes tried so far, in order.
    pub fn attempted(&self) -> &[NodeAddress] {
        &self.attempted
    }

    pub fn is_done(&self) -> bool {
        self.sink.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.sink.is_cancelled()
    }

    /// Streaming chunks already handed to the caller.
    pub fn delivered(&self) -> usize {
        self.sink.delivered()
    }

    pub(crate) fn record_attempt(&mut self, node: &NodeAddress) {
        self.attempted.push(node.clone());
    }

    pub(crate) fn mark_queued(&mut self) {
        self.queued_at = Instant::now();
    }

    pub(crate) fn record_retry(&mut self, cause: ClientError) {
        self.retries += 1;
        self.last_error = Some(cause);
        self.mark_queued();
    }

    pub(crate) fn take_last_error(&mut self) -> Option<ClientError> {
        self.last_error.take()
    }

    /// Feeds one response frame to the decoder. Error replies complete the
    /// operation without reaching the decoder.
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Progress {
        if let Some(err) = error_from_frame(&frame) {
            let err = self.map_error(err);
            self.sink.fail(err);
            return Progress::Complete;
        }
        self.sink.on_frame(frame)
    }

    /// Completes the future with `err`. Returns false if already complete.
    pub(crate) fn fail(&mut self, err: ClientError) -> bool {
        self.sink.fail(err)
    }

    pub(crate) fn set_cancel_hook(&self, hook: CancelHook) -> bool {
        self.sink.set_cancel_hook(hook)
    }

    pub(crate) fn clear_cancel_hook(&self) {
        self.sink.clear_cancel_hook()
    }

    fn map_error(&self, err: ClientError) -> ClientError {
        match (&self.coverage_target, err) {
            (Some(target), ClientError::Application { code, message })
                if code == STALE_COVERAGE_CODE =>
            {
                ClientError::StalePlan {
                    address: target.to_string(),
                    message,
                }
            }
            (_, err) => err,
        }
    }
}
