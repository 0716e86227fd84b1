//! Completion handles returned to callers.
//!
//! An operation is completed through its [`Promise`]; the caller holds the
//! matching [`OperationFuture`] (one value) or [`StreamingFuture`] (a sequence
//! of chunks followed by a terminal status).
//!
//! A future moves from pending to complete exactly once, with either a value
//! or a single [`ClientError`]. Listeners run exactly once, on the completing
//! thread, or immediately on the registering thread if the future is already
//! complete. [`OperationFuture::wait`] parks the caller on a condition variable
//! and never polls.
//!
//! Streaming chunks are buffered inside the shared state until consumed, so a
//! consumer that attaches late, even after completion, still sees every chunk
//! in server order before the end of the sequence. Consumption pops chunks; the
//! sequence cannot be replayed.
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::{ClientError, lock};

type Listener<T> = Box<dyn FnOnce(&Result<T, ClientError>) + Send + 'static>;

/// Closes whatever is carrying the operation; runs once on cancellation.
pub type CancelHook = Box<dyn FnOnce() + Send + 'static>;

enum Slot<T> {
    Pending,
    /// Outcome is out of the lock while listeners run.
    Completing,
    Done(Result<T, ClientError>),
    Taken,
}

struct State<T, C> {
    slot: Slot<T>,
    chunks: VecDeque<C>,
    delivered: usize,
    listeners: Vec<Listener<T>>,
    cancel_hook: Option<CancelHook>,
    cancelled: bool,
}

struct Shared<T, C> {
    state: Mutex<State<T, C>>,
    cond: Condvar,
}

impl<T, C> Shared<T, C> {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slot: Slot::Pending,
                chunks: VecDeque::new(),
                delivered: 0,
                listeners: Vec::new(),
                cancel_hook: None,
                cancelled: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn is_done(&self) -> bool {
        !matches!(lock(&self.state).slot, Slot::Pending)
    }

    fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    /// Moves pending -> complete. Returns false if already complete.
    fn complete(&self, result: Result<T, ClientError>, cancelled: bool) -> bool {
        let (listeners, hook) = {
            let mut state = lock(&self.state);
            if !matches!(state.slot, Slot::Pending) {
                return false;
            }
            state.cancelled = cancelled;
            state.slot = Slot::Completing;
            (
                std::mem::take(&mut state.listeners),
                state.cancel_hook.take(),
            )
        };

        if cancelled {
            if let Some(hook) = hook {
                hook();
            }
        }

        self.run_listeners(result, listeners);
        true
    }

    /// Runs listeners against `result` outside the lock, then publishes it.
    /// Listeners registered while this runs are picked up before publishing.
    fn run_listeners(&self, result: Result<T, ClientError>, mut listeners: Vec<Listener<T>>) {
        loop {
            for listener in listeners.drain(..) {
                listener(&result);
            }

            let mut state = lock(&self.state);
            if state.listeners.is_empty() {
                state.slot = Slot::Done(result);
                drop(state);
                self.cond.notify_all();
                return;
            }
            listeners = std::mem::take(&mut state.listeners);
        }
    }

    fn add_listener(&self, listener: Listener<T>) {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Done(result) => {
                state.slot = Slot::Completing;
                drop(state);
                self.run_listeners(result, vec![listener]);
            }
            other => {
                state.slot = other;
                state.listeners.push(listener);
            }
        }
    }

    fn cancel(&self) -> bool {
        self.complete(Err(ClientError::Cancelled), true)
    }

    fn set_cancel_hook(&self, hook: CancelHook) -> bool {
        let mut state = lock(&self.state);
        if !matches!(state.slot, Slot::Pending) {
            return false;
        }
        state.cancel_hook = Some(hook);
        true
    }

    fn clear_cancel_hook(&self) {
        lock(&self.state).cancel_hook = None;
    }

    fn push_chunk(&self, chunk: C) -> bool {
        let mut state = lock(&self.state);
        if !matches!(state.slot, Slot::Pending) {
            return false;
        }
        state.chunks.push_back(chunk);
        state.delivered += 1;
        drop(state);
        self.cond.notify_all();
        true
    }

    fn delivered(&self) -> usize {
        lock(&self.state).delivered
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if settled(&state.slot) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn take(&self) -> Result<T, ClientError> {
        let mut state = lock(&self.state);
        while !settled(&state.slot) {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match std::mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Done(result) => result,
            _ => Err(ClientError::Cancelled),
        }
    }

    fn next_chunk(&self, deadline: Option<Instant>) -> Option<C> {
        let mut state = lock(&self.state);
        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                return Some(chunk);
            }
            if settled(&state.slot) {
                return None;
            }
            state = match deadline {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    match self.cond.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }
}

fn settled<T>(slot: &Slot<T>) -> bool {
    matches!(slot, Slot::Done(_) | Slot::Taken)
}

/// Completion side of an operation, owned by whoever is executing it.
///
/// Dropping a promise that was never completed fails its future with
/// [`ClientError::Shutdown`], so callers are never left waiting on work that
/// was discarded.
pub struct Promise<T, C = ()> {
    shared: Arc<Shared<T, C>>,
}

impl<T, C> Promise<T, C> {
    pub fn succeed(&self, value: T) -> bool {
        self.shared.complete(Ok(value), false)
    }

    pub fn fail(&self, err: ClientError) -> bool {
        self.shared.complete(Err(err), false)
    }

    /// Appends a streaming chunk. Ignored once the future is complete.
    pub fn push(&self, chunk: C) -> bool {
        self.shared.push_chunk(chunk)
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Number of chunks pushed so far.
    pub fn delivered(&self) -> usize {
        self.shared.delivered()
    }

    /// Registers the action that aborts in-flight I/O when the caller cancels.
    /// Returns false, without storing the hook, if the future already completed.
    pub fn set_cancel_hook(&self, hook: CancelHook) -> bool {
        self.shared.set_cancel_hook(hook)
    }

    pub fn clear_cancel_hook(&self) {
        self.shared.clear_cancel_hook()
    }
}

impl<T, C> Drop for Promise<T, C> {
    fn drop(&mut self) {
        self.shared.complete(Err(ClientError::Shutdown), false);
    }
}

/// Creates a single-shot promise and its future.
pub fn promise<T>() -> (Promise<T>, OperationFuture<T>) {
    let shared = Arc::new(Shared::new());
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        OperationFuture { shared },
    )
}

/// Creates a streaming promise and its future.
pub fn stream<C>() -> (Promise<(), C>, StreamingFuture<C>) {
    let shared = Arc::new(Shared::new());
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        StreamingFuture { shared },
    )
}

/// Result of a single-shot operation.
pub struct OperationFuture<T> {
    shared: Arc<Shared<T, ()>>,
}

impl<T> OperationFuture<T> {
    /// Blocks until the operation completes and returns its outcome.
    pub fn wait(self) -> Result<T, ClientError> {
        self.shared.take()
    }

    /// Blocks for at most `timeout`; returns whether the future completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.wait_timeout(timeout)
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, ClientError>) + Send + 'static,
    {
        self.shared.add_listener(Box::new(listener))
    }

    /// Requests cancellation. No-op, returning false, once complete.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }
}

/// Result of a streaming operation: ordered chunks, then a terminal status.
///
/// Iterating yields chunks in the order the server produced them and ends
/// after the last chunk of a completed operation. Call [`wait`](Self::wait)
/// afterwards to learn whether the stream ended cleanly.
pub struct StreamingFuture<C> {
    shared: Arc<Shared<(), C>>,
}

impl<C> StreamingFuture<C> {
    /// Blocks until the next chunk arrives or the stream ends.
    pub fn next_chunk(&self) -> Option<C> {
        self.shared.next_chunk(None)
    }

    /// Like [`next_chunk`](Self::next_chunk) but gives up after `timeout`.
    pub fn next_chunk_timeout(&self, timeout: Duration) -> Option<C> {
        self.shared.next_chunk(Some(Instant::now() + timeout))
    }

    /// Terminal status. Unconsumed chunks are discarded.
    pub fn wait(self) -> Result<(), ClientError> {
        self.shared.take()
    }

    /// Drains every chunk, then returns them with the terminal status.
    /// Chunks delivered before a failure are returned alongside it.
    pub fn collect_all(self) -> (Vec<C>, Result<(), ClientError>) {
        let mut chunks = Vec::new();
        while let Some(chunk) = StreamingFuture::next_chunk(&self) {
            chunks.push(chunk);
        }
        (chunks, self.wait())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.wait_timeout(timeout)
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<(), ClientError>) + Send + 'static,
    {
        self.shared.add_listener(Box::new(listener))
    }

    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }
}

impl<C> Iterator for StreamingFuture<C> {
    type Item = C;

    fn next(&mut self) -> Option<C> {
        StreamingFuture::next_chunk(self)
    }
}
