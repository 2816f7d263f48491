//! Core state machine for transparent TLS handshake interception.
//!
//! This crate contains the per-connection logic of a traffic interceptor
//! that sits beneath a TCP stack: a keyed table of monitored connections,
//! a record-level handshake parser per flow direction, and the five hook
//! entry points (`connect`, `close`, `disconnect`, `send`, `recv`) that
//! wrap the underlying transport operations. It performs no I/O
//! whatsoever; the caller supplies the transport through the
//! [`Transport`](trait.Transport.html) trait and invokes the hooks on
//! [`Interceptor`](struct.Interceptor.html) in place of the plain
//! transport calls.
//!
//! The hooks preserve the transport's user-visible semantics exactly:
//! partial sends, non-blocking errors, blocking retries, and byte counts
//! behave as the unwrapped transport would have behaved, even while the
//! interceptor buffers, parses, and possibly substitutes the bytes in
//! flight. Once a connection's server certificate chain and hello records
//! have been captured, the evidence is submitted to an out-of-band
//! [`PolicyEngine`](trait.PolicyEngine.html) whose verdict decides whether
//! the connection proceeds untouched or is terminated with a fatal alert.

extern crate byteorder;
extern crate bytes;
#[macro_use]
extern crate failure;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate rand;
#[cfg(test)]
extern crate slog_term;

mod connection;
mod handshake;
mod interceptor;
mod table;
mod verdict;

pub use connection::{CaptureError, ConnState, DirState, Handler, QueuedReturn, Session};
pub use handshake::TlsHandler;
pub use interceptor::{Config, Interceptor, Transport};
pub use table::{ConnKey, ConnTable, ConnectionHandle, InsertError};
pub use verdict::{PolicyEngine, Query, Verdict};

/// Length of a TLS record header: content type, protocol version, and
/// payload length. Also the number of bytes needed to decide whether a
/// fresh stream carries a handshake at all, so it is the initial read
/// request for every monitored direction.
pub const TLS_RECORD_HEADER_SIZE: usize = 5;

/// Direction of flow relative to the local process.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// Local process to peer.
    Send,
    /// Peer to local process.
    Recv,
}

/// Whether a monitored direction still has work to do.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interest {
    Relevant,
    /// Terminal; remaining buffered bytes pass through verbatim and the
    /// record may be dropped once both forward queues drain.
    Irrelevant,
}

/// Coarse classification of a monitored connection.
///
/// Ordered by progression through the monitoring lifecycle: when the two
/// directions of a connection classify differently, the later variant
/// supersedes the earlier one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Status {
    /// Nothing identified yet.
    Unknown,
    /// A full `ClientHello` has been observed on the send side.
    ClientHelloSent,
    /// A full `ServerHello` has been observed on the recv side.
    ServerHelloSeen,
    /// The stream is of no further interest.
    Irrelevant,
    /// Monitoring was abandoned after an unrecoverable failure.
    Failed,
}

/// Error reported by the underlying transport.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum SockError {
    /// The operation cannot make progress without blocking.
    #[fail(display = "operation would block")]
    WouldBlock,
    /// Any other transport failure, in the transport's native error code.
    #[fail(display = "transport error code {}", _0)]
    Os(i32),
}

/// Outcome of driving the underlying transport once.
#[derive(Debug, Clone, PartialEq)]
pub enum IoStatus {
    /// Bytes moved. Zero from a recv is end of stream.
    Done(usize),
    /// The operation was submitted asynchronously with the supplied
    /// buffer; [`Transport::complete`](trait.Transport.html) yields the
    /// settled outcome.
    Queued,
    /// The transport made no progress.
    Err(SockError),
}
