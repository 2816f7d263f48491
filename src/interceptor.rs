//! The five transport hooks and the interceptor that owns the
//! connection table.

use std::cmp;
use std::net::SocketAddr;
use std::sync::Arc;

use slog::Logger;

use connection::{ConnState, Handler, QueuedReturn};
use handshake::TlsHandler;
use table::{ConnKey, ConnTable};
use verdict::PolicyEngine;
use {Interest, IoStatus, SockError, Status};

/// Parameters governing the interception core.
pub struct Config {
    /// Number of buckets in the connection table. Must be a power of
    /// two.
    pub buckets: usize,
    /// Upper bound on bytes buffered per direction before monitoring of
    /// a connection is abandoned.
    pub capture_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            buckets: 256,
            capture_cap: 256 * 1024,
        }
    }
}

/// The underlying TCP operations the hooks wrap.
///
/// The caller serializes invocations per socket; the interceptor never
/// re-enters the transport for the same socket concurrently. Buffers the
/// interceptor passes are its own and must be treated as trusted
/// regardless of the address space the original user call came from.
///
/// A `Queued` return means the operation was submitted asynchronously
/// with the supplied buffer; [`complete`](#tymethod.complete) blocks
/// until it finishes and yields the settled outcome.
pub trait Transport {
    fn connect(&mut self, remote: &SocketAddr) -> Result<(), SockError>;
    fn close(&mut self);
    /// Reset the connection while keeping the socket usable.
    fn disconnect(&mut self);
    fn send(&mut self, data: &[u8], nonblock: bool) -> IoStatus;
    fn recv(&mut self, buf: &mut [u8], nonblock: bool) -> IoStatus;
    /// Await the completion of a previously `Queued` operation.
    fn complete(&mut self) -> IoStatus;
}

/// Resolve asynchronous completions so the hooks only ever reason about
/// settled outcomes.
fn settle<T: Transport>(transport: &mut T, status: IoStatus) -> IoStatus {
    match status {
        IoStatus::Queued => transport.complete(),
        other => other,
    }
}

/// The main entry point to the library.
///
/// This object performs no I/O whatsoever. The caller routes every
/// intercepted transport operation through the matching hook, supplying
/// the underlying operations via a [`Transport`](trait.Transport.html);
/// the hooks reproduce the transport's user-visible semantics while
/// feeding the byte stream through the handshake parser. Hooks may be
/// invoked from many threads at once; per-socket serialization is the
/// caller's contract, mirroring the socket lock of the host stack.
pub struct Interceptor {
    log: Logger,
    table: ConnTable,
    policy: Arc<dyn PolicyEngine>,
    handler: Arc<dyn Handler>,
}

impl Interceptor {
    /// Build an interceptor running the TLS handshake handler.
    pub fn new(log: Logger, config: Config, policy: Arc<dyn PolicyEngine>) -> Self {
        let handler = Arc::new(TlsHandler::new(config.capture_cap));
        Self::with_handler(log, config, policy, handler)
    }

    /// Build an interceptor around a custom protocol handler.
    pub fn with_handler(
        log: Logger,
        config: Config,
        policy: Arc<dyn PolicyEngine>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let table = ConnTable::new(log.new(o!()), config.buckets);
        Interceptor {
            log,
            table,
            policy,
            handler,
        }
    }

    pub fn table(&self) -> &ConnTable {
        &self.table
    }

    /// Wrap the underlying connect. A fresh record is registered no
    /// matter what the transport reported; the record's fate depends on
    /// what the parser sees, not on the establishment result.
    pub fn connect<T: Transport>(
        &self,
        pid: u32,
        fd: u32,
        remote: SocketAddr,
        transport: &mut T,
    ) -> Result<(), SockError> {
        let ret = transport.connect(&remote);
        if self.table.remove(pid, fd) {
            // Reconnect of a socket we were already watching; the stale
            // record cannot describe the new byte stream.
            debug!(self.log, "replacing stale record"; "pid" => pid, "fd" => fd);
        }
        let log = self.log.new(o!("pid" => pid, "fd" => fd));
        info!(log, "monitoring outbound connection"; "remote" => %remote);
        let session = self.handler.open(log.clone(), pid, fd, remote);
        let conn = ConnState::new(log, ConnKey::new(pid, fd), remote, session);
        if let Err(e) = self.table.insert(conn) {
            warn!(self.log, "failed to register connection"; "err" => %e);
        }
        ret
    }

    /// Wrap the underlying close, dropping any record first.
    pub fn close<T: Transport>(&self, pid: u32, fd: u32, transport: &mut T) {
        if self.table.remove(pid, fd) {
            info!(self.log, "connection closed"; "pid" => pid, "fd" => fd);
        }
        transport.close();
    }

    /// Pass through. The socket may be reconnected, so the record is
    /// retained.
    pub fn disconnect<T: Transport>(&self, _pid: u32, _fd: u32, transport: &mut T) {
        transport.disconnect();
    }

    /// Wrap the underlying send.
    ///
    /// On success the user observes exactly `data.len()` bytes sent,
    /// even when the parser chose to forward a different region (or
    /// nothing at all) downstream; on a transport error the user
    /// observes that error and is expected to retry with the same bytes.
    pub fn send<T: Transport>(
        &self,
        pid: u32,
        fd: u32,
        data: &[u8],
        nonblock: bool,
        transport: &mut T,
    ) -> IoStatus {
        let conn = match self.table.get(pid, fd) {
            Some(conn) => conn,
            None => {
                let ret = transport.send(data, nonblock);
                return settle(transport, ret);
            }
        };
        let mut conn = conn.lock().unwrap();

        if conn.queued_send.made_progress() {
            if let Err(e) = conn.send.capture(data) {
                warn!(conn.log, "capture failed, abandoning monitoring"; "err" => %e);
                conn.status = Status::Failed;
                drop(conn);
                self.table.remove(pid, fd);
                let ret = transport.send(data, nonblock);
                return settle(transport, ret);
            }
            conn.send.update(&*self.policy);
            conn.note_status();
        } else {
            // A retry of a failed call carries the same bytes; skipping
            // capture and update keeps every byte out of the buffer the
            // second time around.
        }

        let wanted = conn.send.bytes_to_forward();
        if wanted == 0 {
            if conn.defunct() {
                drop(conn);
                self.cease(pid, fd);
            }
            // The user's bytes now live in the capture buffer and will
            // be released downstream later; report them all sent.
            return IoStatus::Done(data.len());
        }

        let ret = transport.send(conn.send.pending(), nonblock);
        let ret = settle(transport, ret);
        conn.queued_send = QueuedReturn::from_send(&ret);
        let sent = match ret {
            IoStatus::Done(n) if n > 0 => n,
            other => return other,
        };
        conn.send.advance(sent);

        if sent < wanted {
            if nonblock {
                // Force a retry with the same user bytes; capture is
                // skipped on re-entry.
                conn.queued_send = QueuedReturn::Err(SockError::WouldBlock);
                return IoStatus::Err(SockError::WouldBlock);
            }
            // Blocking caller: drain now, as this may be the last time
            // this socket's send hook runs.
            while conn.send.bytes_to_forward() > 0 {
                let ret = transport.send(conn.send.pending(), false);
                let ret = settle(transport, ret);
                conn.queued_send = QueuedReturn::from_send(&ret);
                match ret {
                    IoStatus::Done(n) if n > 0 => conn.send.advance(n),
                    other => return other,
                }
            }
        }

        if conn.defunct() {
            drop(conn);
            self.cease(pid, fd);
        }
        IoStatus::Done(data.len())
    }

    /// Wrap the underlying recv.
    ///
    /// The transport is read in units chosen by the parser, decoupled
    /// from the user's requested length; this hook reconciles the two
    /// without losing bytes across partial reads, errors, or end of
    /// stream.
    pub fn recv<T: Transport>(
        &self,
        pid: u32,
        fd: u32,
        buf: &mut [u8],
        nonblock: bool,
        transport: &mut T,
    ) -> IoStatus {
        let conn = match self.table.get(pid, fd) {
            Some(conn) => conn,
            None => {
                let ret = transport.recv(buf, nonblock);
                return settle(transport, ret);
            }
        };
        let mut conn = conn.lock().unwrap();
        let mut copied = 0;

        // Hand over whatever is already marked for delivery.
        let cached = conn.recv.bytes_to_forward();
        if cached > 0 {
            let n = cmp::min(buf.len(), cached);
            buf[..n].copy_from_slice(&conn.recv.pending()[..n]);
            conn.recv.advance(n);
            copied += n;
            trace!(conn.log, "delivered cached bytes"; "count" => n);
        }
        if copied == buf.len() {
            return IoStatus::Done(copied);
        }

        // Replay a terminal condition observed on an earlier refill.
        if copied == 0 {
            match conn.queued_recv.clone() {
                QueuedReturn::Eof => {
                    drop(conn);
                    self.table.remove(pid, fd);
                    debug!(self.log, "end of stream delivered"; "pid" => pid, "fd" => fd);
                    return IoStatus::Done(0);
                }
                QueuedReturn::Err(e) => {
                    conn.queued_recv = QueuedReturn::Neutral;
                    return IoStatus::Err(e);
                }
                _ => {}
            }
        }

        // Refill from the transport in parser-chosen units until
        // something becomes deliverable.
        while conn.recv.bytes_to_forward() == 0 {
            let need = conn.recv.bytes_to_read();
            if need == 0 {
                // The parser wants nothing further from this stream.
                if copied > 0 {
                    return IoStatus::Done(copied);
                }
                if conn.recv.interest() == Interest::Irrelevant {
                    if conn.defunct() {
                        drop(conn);
                        self.cease(pid, fd);
                    } else {
                        // The send side is still flushing; the record
                        // falls to a later hook.
                        drop(conn);
                    }
                    let ret = transport.recv(buf, nonblock);
                    return settle(transport, ret);
                }
                // Withheld stream: report end of it while keeping the
                // record so the send hook stays in charge.
                return IoStatus::Done(0);
            }
            let mut scratch = vec![0; need];
            let ret = transport.recv(&mut scratch, nonblock);
            let ret = settle(transport, ret);
            conn.queued_recv = QueuedReturn::from_recv(&ret);
            let got = match ret {
                IoStatus::Done(n) if n > 0 => n,
                IoStatus::Done(_) => {
                    // End of stream: deliver it now if nothing is owed,
                    // otherwise it replays on the next call.
                    if copied > 0 {
                        return IoStatus::Done(copied);
                    }
                    drop(conn);
                    self.table.remove(pid, fd);
                    debug!(self.log, "end of stream delivered"; "pid" => pid, "fd" => fd);
                    return IoStatus::Done(0);
                }
                IoStatus::Err(e) => {
                    if copied > 0 {
                        // The error stays cached for the next call.
                        return IoStatus::Done(copied);
                    }
                    conn.queued_recv = QueuedReturn::Neutral;
                    return IoStatus::Err(e);
                }
                IoStatus::Queued => unreachable!("completions are settled above"),
            };
            if let Err(e) = conn.recv.capture(&scratch[..got]) {
                // The bytes were already consumed from the transport;
                // there is no way to put them back.
                warn!(conn.log, "capture failed on receive path"; "err" => %e);
                conn.status = Status::Failed;
                drop(conn);
                self.table.remove(pid, fd);
                return IoStatus::Done(copied);
            }
            conn.recv.update(&*self.policy);
            conn.note_status();
            if nonblock && conn.recv.bytes_to_forward() == 0 {
                if copied > 0 {
                    return IoStatus::Done(copied);
                }
                return IoStatus::Err(SockError::WouldBlock);
            }
        }

        // Deliver from the refilled capture buffer.
        let pending = conn.recv.bytes_to_forward();
        let n = cmp::min(buf.len() - copied, pending);
        buf[copied..copied + n].copy_from_slice(&conn.recv.pending()[..n]);
        conn.recv.advance(n);
        copied += n;
        IoStatus::Done(copied)
    }

    /// Drop every record, e.g. when the hooks are being torn down.
    pub fn shutdown(&self) {
        let dropped = self.table.free_all();
        info!(self.log, "interceptor shut down"; "records_dropped" => dropped);
    }

    fn cease(&self, pid: u32, fd: u32) {
        if self.table.remove(pid, fd) {
            info!(self.log, "no longer interested in socket, ceasing monitoring";
                  "pid" => pid, "fd" => fd);
        }
    }
}
