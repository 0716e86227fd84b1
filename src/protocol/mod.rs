//! Client-server wire protocol.
//!
//! This module defines how requests and responses travel between the client
//! engine and store nodes: the frame format, a blocking frame transport, the
//! handful of messages the engine itself needs to understand, and a small
//! frame server used to stand in for real nodes.
//!
//! # Overview
//!
//! Everything above this layer treats message codes as opaque integers. A
//! command hands the engine an opcode and an already encoded payload, and
//! receives decoded frames back. The only codes interpreted here are the error
//! reply, ping, and the coverage planning exchange.
//!
//! # Key Components
//!
//! - [`Frame`] / [`FrameCodec`]: length-prefixed framing and resumable decoding.
//! - [`FrameTransport`]: frames over any `Read + Write`, resuming short writes.
//! - [`ThreadPool`]: fixed worker pool driving dispatch and the frame server.
//! - [`FrameServer`]: scripted server for simulations and the stub binary.
//!
//! # Binary Format
//!
//! - A 4-byte unsigned big-endian length covering opcode and payload.
//! - A 1-byte opcode.
//! - `length - 1` payload bytes.
//!
//! Structured payloads owned by this crate (error replies, coverage plans) are
//! bincode-encoded, big-endian with fixed-width integers.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): drives a transport for one operation at a time.
mod frame;
mod message;
pub mod server;
mod thread;
mod transport;

pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, Decoded, Frame, FrameCodec, FrameError, LENGTH_PREFIX_SIZE, decode,
    encode,
};
pub use message::{
    COVERAGE_REQUEST, COVERAGE_RESPONSE, CoverageRequest, ERROR_RESPONSE, ErrorResponse,
    PING_REQUEST, PING_RESPONSE, STALE_COVERAGE_CODE, decode_payload, encode_payload,
    error_from_frame, expect_pong, ping,
};
pub use server::{FrameHandler, FrameServer, Reply, ServerHandle, StubHandler};
pub use thread::{PoolClosed, ThreadPool};
pub use transport::{FrameTransport, TransportError};
