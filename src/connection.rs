//! Per-connection record and the operations surface protocol handlers
//! expose to the transport hooks.

use std::cmp;
use std::net::SocketAddr;

use slog::Logger;

use table::ConnKey;
use verdict::PolicyEngine;
use {Interest, IoStatus, SockError, Status};

/// Cached outcome of the last underlying transport operation in one
/// direction. Governs whether a user call is a retry (capture must be
/// skipped so no byte enters the buffer twice) and lets end-of-stream and
/// errors be replayed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedReturn {
    /// The transport moved this many bytes.
    Ok(usize),
    /// The transport reported end of stream.
    Eof,
    /// The transport failed; the error is owed to the user.
    Err(SockError),
    /// Nothing outstanding; proceed as if the previous call succeeded.
    Neutral,
}

impl QueuedReturn {
    /// True when the current user call is not a retry of a failed one,
    /// i.e. the previous underlying operation moved a positive number of
    /// bytes or there was no previous operation.
    pub fn made_progress(&self) -> bool {
        match *self {
            QueuedReturn::Ok(n) => n > 0,
            QueuedReturn::Neutral => true,
            _ => false,
        }
    }

    pub fn from_send(status: &IoStatus) -> Self {
        match *status {
            IoStatus::Done(n) => QueuedReturn::Ok(n),
            IoStatus::Err(ref e) => QueuedReturn::Err(e.clone()),
            IoStatus::Queued => QueuedReturn::Neutral,
        }
    }

    pub fn from_recv(status: &IoStatus) -> Self {
        match *status {
            IoStatus::Done(0) => QueuedReturn::Eof,
            IoStatus::Done(n) => QueuedReturn::Ok(n),
            IoStatus::Err(ref e) => QueuedReturn::Err(e.clone()),
            IoStatus::Queued => QueuedReturn::Neutral,
        }
    }
}

/// Appending to a capture buffer failed because the configured cap would
/// be exceeded.
#[derive(Debug, Fail)]
#[fail(display = "capture buffer full ({} buffered + {} incoming > {} cap)", len, add, cap)]
pub struct CaptureError {
    pub len: usize,
    pub add: usize,
    pub cap: usize,
}

/// Operations the transport hooks use to drive one direction of a
/// monitored connection without knowing the parser's internals.
///
/// After every [`update`](#tymethod.update), at least one of the
/// following holds: `bytes_to_read() > 0`, `bytes_to_forward() > 0`, or
/// the direction is terminal.
pub trait DirState: Send {
    /// Append observed bytes to the capture buffer.
    fn capture(&mut self, data: &[u8]) -> Result<(), CaptureError>;

    /// Consult the capture buffer and advance the direction's state
    /// machine, updating `bytes_to_read` and `bytes_to_forward`. May
    /// submit completed evidence to the policy engine.
    fn update(&mut self, policy: &dyn PolicyEngine);

    /// The region currently published for forwarding: bytes the send
    /// hook must hand to the transport, or the recv hook must copy to
    /// the user. May be empty.
    fn pending(&self) -> &[u8];

    /// Bytes currently marked for forwarding and not yet reported via
    /// [`advance`](#tymethod.advance).
    fn bytes_to_forward(&self) -> usize;

    /// Input bytes the parser wants before it can make progress.
    fn bytes_to_read(&self) -> usize;

    /// Report transport progress over the published region. Compacts the
    /// capture buffer once a forwarding episode completes.
    fn advance(&mut self, n: usize);

    fn interest(&self) -> Interest;

    /// Coarse classification for the record's status tag.
    fn status(&self) -> Status;
}

/// Paired direction states constructed by a handler for one connection.
pub struct Session {
    pub send: Box<dyn DirState>,
    pub recv: Box<dyn DirState>,
}

/// A protocol handler. The TLS handshake handler is the initial
/// implementor; other stream protocols can be attached by implementing
/// this trait and handing the handler to the interceptor.
pub trait Handler: Send + Sync {
    fn open(&self, log: Logger, pid: u32, fd: u32, remote: SocketAddr) -> Session;
}

/// Per-socket state owned by the interceptor for one `(pid, fd)`.
pub struct ConnState {
    pub key: ConnKey,
    /// Cached hash input, the XOR of the key components.
    pub hash: u32,
    pub status: Status,
    pub send: Box<dyn DirState>,
    pub recv: Box<dyn DirState>,
    pub queued_send: QueuedReturn,
    pub queued_recv: QueuedReturn,
    pub remote: SocketAddr,
    pub log: Logger,
}

impl ConnState {
    pub fn new(log: Logger, key: ConnKey, remote: SocketAddr, session: Session) -> Self {
        ConnState {
            hash: key.hash(),
            key,
            status: Status::Unknown,
            send: session.send,
            recv: session.recv,
            queued_send: QueuedReturn::Neutral,
            queued_recv: QueuedReturn::Neutral,
            remote,
            log,
        }
    }

    /// True when the parser has nothing further to do on either direction
    /// and both forward queues have drained. Such a record may be dropped
    /// by whichever hook observes it.
    pub fn defunct(&self) -> bool {
        self.send.interest() == Interest::Irrelevant
            && self.recv.interest() == Interest::Irrelevant
            && self.send.bytes_to_forward() == 0
            && self.recv.bytes_to_forward() == 0
    }

    /// Refresh the coarse classification from the direction states,
    /// logging the transition. The directions may classify
    /// independently; the record carries the more advanced of the two.
    pub fn note_status(&mut self) {
        let status = cmp::max(self.send.status(), self.recv.status());
        if status != self.status {
            debug!(self.log, "connection reclassified";
                   "from" => ?self.status, "to" => ?status);
            self.status = status;
        }
    }
}
