//! One socket to one node.
//!
//! A [`Connection`] carries at most one operation at a time; the protocol is
//! strictly request/response per socket. It moves
//! `Idle -> Writing -> AwaitingResponse -> Idle`, or to `Closed` on any I/O
//! error, timeout or framing violation. A closed connection is never reused.
use std::{
    io::{self, ErrorKind},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{
    ClientError,
    config::NodeAddress,
    operation::{Operation, Progress},
    protocol::{FrameTransport, TransportError},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Writing,
    AwaitingResponse,
    Closed,
}

/// What an idle connection looks like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Ready,
    /// The server closed its side while the connection sat idle.
    PeerClosed,
    /// Bytes arrived with no request outstanding.
    StrayData,
}

pub struct Connection {
    id: u64,
    address: NodeAddress,
    transport: FrameTransport<TcpStream>,
    state: ConnectionState,
    max_frame_size: usize,
    request_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// Connects to `address`, trying each resolved socket address in turn.
    pub fn open(
        address: &NodeAddress,
        connect_timeout: Duration,
        request_timeout: Duration,
        max_frame_size: usize,
    ) -> Result<Self, ClientError> {
        let connect_error = |source: io::Error| ClientError::Connect {
            address: address.to_string(),
            source,
        };

        let candidates = (address.host.as_str(), address.port)
            .to_socket_addrs()
            .map_err(connect_error)?;

        let mut last = None;
        for addr in candidates {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(connect_error)?;
                    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
                    debug!("connection {id} opened to {address} ({addr})");
                    return Ok(Self {
                        id,
                        address: address.clone(),
                        transport: FrameTransport::new(stream, max_frame_size),
                        state: ConnectionState::Idle,
                        max_frame_size,
                        request_timeout,
                    });
                }
                Err(e) => {
                    trace!("connect to {addr} failed: {e}");
                    last = Some(e);
                }
            }
        }

        Err(connect_error(last.unwrap_or_else(|| {
            io::Error::new(ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Runs `op` to a terminal frame.
    ///
    /// `Ok` means a response arrived and the operation's future is complete,
    /// even if the server answered with an error. `Err` is a transport
    /// failure that left the future pending so the caller can retry it, or
    /// `Cancelled` if the caller gave up. The deadline counts from when the
    /// operation was queued. Any error other than an oversized or already
    /// expired request leaves the connection closed.
    pub fn send(&mut self, op: &mut Operation) -> Result<(), ClientError> {
        if self.state != ConnectionState::Idle {
            return Err(ClientError::Io(io::Error::new(
                ErrorKind::NotConnected,
                format!("connection {} is {:?}", self.id, self.state),
            )));
        }

        let bytes = op.request().encode(self.max_frame_size)?;

        let timeout = op.timeout().unwrap_or(self.request_timeout);
        let deadline = op.queued_at() + timeout;
        if remaining(deadline).is_none() {
            debug!("{op:?} expired in the queue before connection {} was used", self.id);
            return Err(ClientError::Timeout(timeout));
        }

        let stream = self.transport.stream().try_clone().map_err(|e| {
            self.close();
            ClientError::Io(e)
        })?;
        let armed = op.set_cancel_hook(Box::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }));
        if !armed {
            return Err(ClientError::Cancelled);
        }

        let result = self.exchange(op, &bytes, deadline, timeout);
        op.clear_cancel_hook();

        match result {
            Ok(()) => Ok(()),
            Err(_) if op.is_cancelled() => {
                debug!("connection {} closed by cancellation", self.id);
                self.close();
                Err(ClientError::Cancelled)
            }
            Err(e) => {
                warn!("connection {} to {} failed: {e}", self.id, self.address);
                self.close();
                Err(e)
            }
        }
    }

    fn exchange(
        &mut self,
        op: &mut Operation,
        bytes: &[u8],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.state = ConnectionState::Writing;
        let write_left = remaining(deadline).ok_or(ClientError::Timeout(timeout))?;
        self.transport.stream().set_write_timeout(Some(write_left))?;
        self.transport
            .write_raw(bytes)
            .map_err(|e| transport_error(e, timeout))?;
        trace!(
            "connection {} sent code={} ({} bytes)",
            self.id,
            op.request().code,
            bytes.len()
        );

        self.state = ConnectionState::AwaitingResponse;
        loop {
            let frame = self
                .transport
                .poll_frame()
                .map_err(|e| transport_error(e, timeout))?;

            let Some(frame) = frame else {
                let read_left = remaining(deadline).ok_or(ClientError::Timeout(timeout))?;
                self.transport.stream().set_read_timeout(Some(read_left))?;
                self.transport
                    .fill()
                    .map_err(|e| transport_error(e, timeout))?;
                continue;
            };

            if op.on_frame(frame) == Progress::Complete {
                break;
            }
        }

        if self.transport.buffered() > 0 {
            warn!(
                "connection {} received {} bytes past the terminal frame",
                self.id,
                self.transport.buffered()
            );
            self.close();
        } else {
            self.state = ConnectionState::Idle;
        }
        Ok(())
    }

    /// Checks, without blocking, whether an idle connection is still usable.
    pub fn liveness(&mut self) -> Liveness {
        if self.state != ConnectionState::Idle {
            return Liveness::PeerClosed;
        }
        if self.transport.buffered() > 0 {
            return Liveness::StrayData;
        }

        let stream = self.transport.stream();
        if stream.set_nonblocking(true).is_err() {
            return Liveness::PeerClosed;
        }
        let mut probe = [0_u8; 1];
        let liveness = match stream.peek(&mut probe) {
            Ok(0) => Liveness::PeerClosed,
            Ok(_) => Liveness::StrayData,
            Err(e) if e.kind() == ErrorKind::WouldBlock => Liveness::Ready,
            Err(_) => Liveness::PeerClosed,
        };
        if stream.set_nonblocking(false).is_err() {
            return Liveness::PeerClosed;
        }
        liveness
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let _ = self.transport.stream().shutdown(Shutdown::Both);
        self.state = ConnectionState::Closed;
        debug!("connection {} to {} closed", self.id, self.address);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() { None } else { Some(left) }
}

fn transport_error(err: TransportError, timeout: Duration) -> ClientError {
    match err {
        TransportError::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            ClientError::Timeout(timeout)
        }
        TransportError::Io(e) => ClientError::Io(e),
        TransportError::Closed { buffered } => ClientError::Io(io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("server closed the connection with {buffered} bytes of a partial frame"),
        )),
        TransportError::Frame(e) => ClientError::UnexpectedData(e.to_string()),
    }
}
