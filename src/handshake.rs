//! Record-level TLS handshake parser.
//!
//! One `TlsDirState` exists per flow direction. Bytes observed by the
//! hooks are appended to its capture buffer; `update` then advances a
//! record-level state machine that requests exactly the bytes it needs
//! for the next decision (a record header, then the remainder of the
//! record body) and marks processed bytes for forwarding. Handshake
//! messages are reassembled across record boundaries; once the
//! `ClientHello`, `ServerHello`, and certificate chain are all in hand
//! the evidence goes to the policy engine, whose verdict either releases
//! the connection to pass-through or substitutes a fatal alert for the
//! client's next outbound bytes.

use std::net::SocketAddr;
use std::str;
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use slog::Logger;

use connection::{CaptureError, DirState, Handler, Session};
use verdict::{PolicyEngine, Query, Verdict};
use {Direction, Interest, Status, TLS_RECORD_HEADER_SIZE};

const CONTENT_HANDSHAKE: u8 = 22;

const HANDSHAKE_HEADER_SIZE: usize = 4;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;
const HANDSHAKE_CERTIFICATE: u8 = 11;
const HANDSHAKE_SERVER_HELLO_DONE: u8 = 14;

const EXT_SERVER_NAME: u16 = 0;
const SNI_HOSTNAME: u8 = 0;

/// Largest record payload tolerated before the stream is written off as
/// not TLS. The protocol maximum plus the legacy expansion allowance.
const MAX_RECORD_LEN: usize = 16384 + 2048;
/// Largest reassembled handshake message tolerated.
const MAX_HANDSHAKE_LEN: usize = 128 * 1024;

/// Fatal `unknown_ca` alert record, substituted for outbound bytes when
/// the verdict rejects the connection.
const FATAL_ALERT: [u8; 7] = [21, 3, 3, 0, 2, 2, 48];

/// The TLS handshake handler: watches each monitored connection for a
/// handshake, collects the evidence the policy engine needs, and loses
/// interest in everything else.
pub struct TlsHandler {
    capture_cap: usize,
}

impl TlsHandler {
    /// `capture_cap` bounds the bytes buffered per direction; a stream
    /// that exceeds it has monitoring abandoned rather than growing the
    /// buffer without limit.
    pub fn new(capture_cap: usize) -> Self {
        TlsHandler { capture_cap }
    }
}

impl Handler for TlsHandler {
    fn open(&self, log: Logger, pid: u32, fd: u32, remote: SocketAddr) -> Session {
        let evidence = Arc::new(Mutex::new(Evidence {
            pid,
            fd,
            remote,
            hostname: None,
            client_hello: None,
            server_hello: None,
            chain: None,
            released: false,
            denied: false,
            alert_armed: false,
            submitted: false,
        }));
        Session {
            send: Box::new(TlsDirState::new(
                log.new(o!("dir" => "send")),
                Direction::Send,
                evidence.clone(),
                self.capture_cap,
            )),
            recv: Box::new(TlsDirState::new(
                log.new(o!("dir" => "recv")),
                Direction::Recv,
                evidence,
                self.capture_cap,
            )),
        }
    }
}

/// Evidence aggregator shared by the two direction states of one
/// connection.
struct Evidence {
    pid: u32,
    fd: u32,
    remote: SocketAddr,
    hostname: Option<String>,
    /// Complete `ClientHello` handshake message, header included.
    client_hello: Option<Vec<u8>>,
    /// Complete `ServerHello` handshake message, header included.
    server_hello: Option<Vec<u8>>,
    /// Body of the `Certificate` message as seen on the wire.
    chain: Option<Vec<u8>>,
    /// The connection is settled and passes through verbatim.
    released: bool,
    /// The verdict rejected the connection.
    denied: bool,
    /// The substitute alert has been handed to the send direction.
    alert_armed: bool,
    submitted: bool,
}

impl Evidence {
    fn complete(&self) -> bool {
        self.client_hello.is_some() && self.server_hello.is_some() && self.chain.is_some()
    }

    fn status(&self) -> Status {
        if self.released || self.denied {
            Status::Irrelevant
        } else if self.server_hello.is_some() {
            Status::ServerHelloSeen
        } else if self.client_hello.is_some() {
            Status::ClientHelloSent
        } else {
            Status::Unknown
        }
    }

    fn submit(&mut self, log: &Logger, policy: &dyn PolicyEngine) -> Verdict {
        self.submitted = true;
        let hostname = match self.hostname {
            Some(ref name) => name.clone(),
            None => self.remote.ip().to_string(),
        };
        let verdict = policy.poll_schemes(Query {
            pid: self.pid,
            fd: self.fd,
            hostname: &hostname,
            port: self.remote.port(),
            chain: self.chain.as_ref().unwrap(),
            client_hello: self.client_hello.as_ref().unwrap(),
            server_hello: self.server_hello.as_ref().unwrap(),
        });
        info!(log, "policy verdict rendered"; "hostname" => %hostname,
              "port" => self.remote.port(), "verdict" => ?verdict);
        verdict
    }
}

enum Phase {
    /// Waiting on a record header.
    Header,
    /// Waiting on the remainder of a handshake record's payload.
    Body(usize),
    /// Terminal: everything captured passes through verbatim.
    Passthrough,
    /// Terminal after a rejecting verdict: bytes are accepted and
    /// dropped, and the record must stay resident so the send hook keeps
    /// answering instead of delegating.
    Denied,
}

/// Parser state for one direction of one monitored connection.
struct TlsDirState {
    log: Logger,
    dir: Direction,
    evidence: Arc<Mutex<Evidence>>,
    /// Capture buffer. The front is the oldest byte not yet released
    /// downstream; `buf[fwd_done..fwd_pending]` is the published region.
    buf: BytesMut,
    /// Offset of the first unparsed byte within `buf`.
    parse_at: usize,
    fwd_pending: usize,
    fwd_done: usize,
    /// Input bytes wanted before the next decision.
    need: usize,
    phase: Phase,
    /// Handshake-message reassembly across record boundaries.
    messages: BytesMut,
    cap: usize,
}

enum Outcome {
    Continue,
    Release,
    Deny,
}

impl TlsDirState {
    fn new(log: Logger, dir: Direction, evidence: Arc<Mutex<Evidence>>, cap: usize) -> Self {
        TlsDirState {
            log,
            dir,
            evidence,
            buf: BytesMut::new(),
            parse_at: 0,
            fwd_pending: 0,
            fwd_done: 0,
            need: TLS_RECORD_HEADER_SIZE,
            phase: Phase::Header,
            messages: BytesMut::new(),
            cap,
        }
    }

    /// Mark the next `n` parsed bytes for verbatim forwarding.
    fn mark(&mut self, n: usize) {
        self.parse_at += n;
        self.fwd_pending += n;
    }

    /// Terminal pass-through: everything captured, parsed or not, is
    /// forwarded as-is from now on.
    fn release_all(&mut self) {
        self.phase = Phase::Passthrough;
        self.need = 0;
        self.fwd_pending = self.buf.len();
        self.parse_at = self.buf.len();
        self.messages.clear();
    }

    /// Apply a rejecting verdict to this direction.
    fn apply_denial(&mut self) {
        match self.dir {
            Direction::Send => {
                let arm = {
                    let mut ev = self.evidence.lock().unwrap();
                    if ev.alert_armed {
                        false
                    } else {
                        ev.alert_armed = true;
                        true
                    }
                };
                self.buf.clear();
                self.fwd_done = 0;
                if arm {
                    self.buf.extend_from_slice(&FATAL_ALERT);
                    self.fwd_pending = FATAL_ALERT.len();
                    debug!(self.log, "substituting fatal alert for outbound bytes");
                } else {
                    self.fwd_pending = 0;
                }
                self.parse_at = self.buf.len();
            }
            Direction::Recv => {
                // Withhold anything not yet delivered to the user.
                self.buf.truncate(self.fwd_done);
                self.fwd_pending = self.fwd_done;
                self.parse_at = self.buf.len();
            }
        }
        self.need = 0;
        self.messages.clear();
        self.phase = Phase::Denied;
    }

    /// Drain complete handshake messages out of the reassembly buffer.
    /// Returns false once a terminal transition has been taken.
    fn drain_messages(&mut self, policy: &dyn PolicyEngine) -> bool {
        while self.messages.len() >= HANDSHAKE_HEADER_SIZE {
            let body_len = ((self.messages[1] as usize) << 16)
                | BigEndian::read_u16(&self.messages[2..4]) as usize;
            if body_len > MAX_HANDSHAKE_LEN {
                debug!(self.log, "oversized handshake message"; "len" => body_len);
                self.evidence.lock().unwrap().released = true;
                self.release_all();
                return false;
            }
            if self.messages.len() < HANDSHAKE_HEADER_SIZE + body_len {
                return true;
            }
            let msg = self.messages.split_to(HANDSHAKE_HEADER_SIZE + body_len);
            if !self.on_message(&msg, policy) {
                return false;
            }
        }
        true
    }

    fn on_message(&mut self, msg: &[u8], policy: &dyn PolicyEngine) -> bool {
        let ty = msg[0];
        let outcome = {
            let mut ev = self.evidence.lock().unwrap();
            match (self.dir, ty) {
                (Direction::Send, HANDSHAKE_CLIENT_HELLO) if ev.client_hello.is_none() => {
                    ev.hostname = parse_sni(&msg[HANDSHAKE_HEADER_SIZE..]);
                    debug!(self.log, "captured ClientHello"; "len" => msg.len(),
                           "sni" => ev.hostname.as_ref().map(|s| s.as_str()).unwrap_or("<none>"));
                    ev.client_hello = Some(msg.to_vec());
                    Outcome::Continue
                }
                (Direction::Send, _) if ev.client_hello.is_none() => {
                    // A stream that does not open with a ClientHello is
                    // not a handshake we can judge.
                    ev.released = true;
                    Outcome::Release
                }
                // Later client flights (key exchange and friends) are
                // forwarded without inspection.
                (Direction::Send, _) => Outcome::Continue,
                (Direction::Recv, HANDSHAKE_SERVER_HELLO) if ev.server_hello.is_none() => {
                    debug!(self.log, "captured ServerHello"; "len" => msg.len());
                    ev.server_hello = Some(msg.to_vec());
                    Outcome::Continue
                }
                (Direction::Recv, _) if ev.server_hello.is_none() => {
                    ev.released = true;
                    Outcome::Release
                }
                (Direction::Recv, HANDSHAKE_CERTIFICATE) if ev.chain.is_none() => {
                    debug!(self.log, "captured certificate chain";
                           "len" => msg.len() - HANDSHAKE_HEADER_SIZE);
                    ev.chain = Some(msg[HANDSHAKE_HEADER_SIZE..].to_vec());
                    Outcome::Continue
                }
                (Direction::Recv, HANDSHAKE_SERVER_HELLO_DONE) => {
                    if ev.complete() && !ev.submitted {
                        match ev.submit(&self.log, policy) {
                            Verdict::Invalid => {
                                ev.denied = true;
                                Outcome::Deny
                            }
                            _ => {
                                ev.released = true;
                                Outcome::Release
                            }
                        }
                    } else {
                        // No chain was presented (resumed or anonymous
                        // handshake); nothing to judge.
                        debug!(self.log, "handshake finished without a certificate chain");
                        ev.released = true;
                        Outcome::Release
                    }
                }
                (Direction::Recv, _) => Outcome::Continue,
            }
        };
        match outcome {
            Outcome::Continue => true,
            Outcome::Release => {
                self.release_all();
                false
            }
            Outcome::Deny => {
                self.apply_denial();
                false
            }
        }
    }
}

impl DirState for TlsDirState {
    fn capture(&mut self, data: &[u8]) -> Result<(), CaptureError> {
        if let Phase::Denied = self.phase {
            // Accepted and dropped.
            return Ok(());
        }
        if self.buf.len() + data.len() > self.cap {
            return Err(CaptureError {
                len: self.buf.len(),
                add: data.len(),
                cap: self.cap,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn update(&mut self, policy: &dyn PolicyEngine) {
        match self.phase {
            Phase::Denied => return,
            Phase::Passthrough => {
                self.release_all();
                return;
            }
            _ => {}
        }

        // Terminal decisions taken by the opposite direction are picked
        // up before any further parsing.
        let (denied, released) = {
            let ev = self.evidence.lock().unwrap();
            (ev.denied, ev.released)
        };
        if denied {
            self.apply_denial();
            return;
        }
        if released {
            self.release_all();
            return;
        }

        loop {
            let avail = self.buf.len() - self.parse_at;
            match self.phase {
                Phase::Header => {
                    if avail < TLS_RECORD_HEADER_SIZE {
                        self.need = TLS_RECORD_HEADER_SIZE - avail;
                        return;
                    }
                    let (ty, major, len) = {
                        let hdr = &self.buf[self.parse_at..self.parse_at + TLS_RECORD_HEADER_SIZE];
                        (hdr[0], hdr[1], BigEndian::read_u16(&hdr[3..5]) as usize)
                    };
                    if ty != CONTENT_HANDSHAKE || major != 3 || len == 0 || len > MAX_RECORD_LEN {
                        debug!(self.log, "stream is not a handshake of interest";
                               "content_type" => ty, "record_len" => len);
                        self.evidence.lock().unwrap().released = true;
                        self.release_all();
                        return;
                    }
                    self.mark(TLS_RECORD_HEADER_SIZE);
                    self.phase = Phase::Body(len);
                }
                Phase::Body(len) => {
                    if avail < len {
                        self.need = len - avail;
                        return;
                    }
                    self.messages
                        .extend_from_slice(&self.buf[self.parse_at..self.parse_at + len]);
                    self.mark(len);
                    self.phase = Phase::Header;
                    if !self.drain_messages(policy) {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.fwd_done..self.fwd_pending]
    }

    fn bytes_to_forward(&self) -> usize {
        self.fwd_pending - self.fwd_done
    }

    fn bytes_to_read(&self) -> usize {
        self.need
    }

    fn advance(&mut self, n: usize) {
        self.fwd_done += n;
        debug_assert!(self.fwd_done <= self.fwd_pending);
        if self.fwd_done == self.fwd_pending && self.fwd_done > 0 {
            let _ = self.buf.split_to(self.fwd_done);
            self.parse_at -= self.fwd_done;
            self.fwd_pending = 0;
            self.fwd_done = 0;
        }
    }

    fn interest(&self) -> Interest {
        match self.phase {
            Phase::Passthrough => Interest::Irrelevant,
            Phase::Denied => Interest::Relevant,
            _ => {
                // A release decided by the opposite direction counts here
                // only once nothing is buffered beyond the marked region.
                let ev = self.evidence.lock().unwrap();
                if ev.released && !ev.denied && self.buf.len() == self.fwd_pending {
                    Interest::Irrelevant
                } else {
                    Interest::Relevant
                }
            }
        }
    }

    fn status(&self) -> Status {
        self.evidence.lock().unwrap().status()
    }
}

/// Pull the SNI hostname out of a `ClientHello` body. Absence and
/// malformation both yield `None`; the caller falls back to the peer
/// address.
fn parse_sni(body: &[u8]) -> Option<String> {
    // legacy_version(2) random(32)
    let mut at = 34;
    let sid_len = *body.get(at)? as usize;
    at += 1 + sid_len;
    let cs_len = read_u16(body, at)? as usize;
    at += 2 + cs_len;
    let comp_len = *body.get(at)? as usize;
    at += 1 + comp_len;
    let ext_total = read_u16(body, at)? as usize;
    at += 2;
    let end = at.checked_add(ext_total)?;
    if end > body.len() {
        return None;
    }
    while at + 4 <= end {
        let ty = read_u16(body, at)?;
        let len = read_u16(body, at + 2)? as usize;
        at += 4;
        if at + len > end {
            return None;
        }
        if ty == EXT_SERVER_NAME {
            // server_name_list: u16 length, then (type, u16 length, name)
            // entries.
            let list_end = at + len;
            let mut p = at + 2;
            while p + 3 <= list_end {
                let name_ty = body[p];
                let name_len = read_u16(body, p + 1)? as usize;
                p += 3;
                if p + name_len > list_end {
                    return None;
                }
                if name_ty == SNI_HOSTNAME {
                    return str::from_utf8(&body[p..p + name_len]).ok().map(str::to_owned);
                }
                p += name_len;
            }
            return None;
        }
        at += len;
    }
    None
}

fn read_u16(b: &[u8], at: usize) -> Option<u16> {
    if at + 2 <= b.len() {
        Some(BigEndian::read_u16(&b[at..at + 2]))
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tests::{client_hello_record, handshake_msg, logger, record, FixedPolicy};

    fn session() -> Session {
        let addr = "[2001:db8::1]:443".parse().unwrap();
        TlsHandler::new(64 * 1024).open(logger(), 42, 7, addr)
    }

    #[test]
    fn non_tls_stream_released_after_header() {
        let mut session = session();
        let policy = FixedPolicy(Verdict::Valid);
        session.send.capture(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        session.send.update(&policy);
        assert_eq!(session.send.interest(), Interest::Irrelevant);
        assert_eq!(session.send.bytes_to_forward(), 18);
        assert_eq!(session.send.bytes_to_read(), 0);
        // The opposite direction follows the release.
        session.recv.update(&policy);
        assert_eq!(session.recv.interest(), Interest::Irrelevant);
    }

    #[test]
    fn header_requests_exact_remainder() {
        let mut session = session();
        let policy = FixedPolicy(Verdict::Valid);
        let record = client_hello_record("example.com");
        session.send.capture(&record[..3]).unwrap();
        session.send.update(&policy);
        assert_eq!(session.send.bytes_to_read(), 2);
        assert_eq!(session.send.bytes_to_forward(), 0);
        session.send.capture(&record[3..5]).unwrap();
        session.send.update(&policy);
        assert_eq!(session.send.bytes_to_read(), record.len() - 5);
        // The header is already marked for forwarding.
        assert_eq!(session.send.bytes_to_forward(), 5);
    }

    #[test]
    fn client_hello_marks_whole_record_forwardable() {
        let mut session = session();
        let policy = FixedPolicy(Verdict::Valid);
        let record = client_hello_record("example.com");
        session.send.capture(&record).unwrap();
        session.send.update(&policy);
        assert_eq!(session.send.bytes_to_forward(), record.len());
        assert_eq!(session.send.bytes_to_read(), TLS_RECORD_HEADER_SIZE);
        assert_eq!(session.send.interest(), Interest::Relevant);
        assert_eq!(session.send.status(), Status::ClientHelloSent);
        assert_eq!(session.send.pending(), &record[..]);
    }

    #[test]
    fn advance_compacts_completed_episode() {
        let mut session = session();
        let policy = FixedPolicy(Verdict::Valid);
        let record = client_hello_record("example.com");
        session.send.capture(&record).unwrap();
        session.send.update(&policy);
        session.send.advance(100);
        assert_eq!(session.send.bytes_to_forward(), record.len() - 100);
        assert_eq!(session.send.pending(), &record[100..]);
        let remaining = session.send.bytes_to_forward();
        session.send.advance(remaining);
        assert_eq!(session.send.bytes_to_forward(), 0);
        assert_eq!(session.send.pending(), b"");
    }

    #[test]
    fn capture_cap_enforced() {
        let addr = "10.0.0.1:443".parse().unwrap();
        let mut session = TlsHandler::new(8).open(logger(), 1, 1, addr);
        assert!(session.send.capture(b"12345678").is_ok());
        let err = session.send.capture(b"9").unwrap_err();
        assert_eq!(err.len, 8);
        assert_eq!(err.add, 1);
        assert_eq!(err.cap, 8);
    }

    #[test]
    fn recv_stream_without_server_hello_released() {
        let mut session = session();
        let policy = FixedPolicy(Verdict::Valid);
        // A lone Finished message where the ServerHello should be.
        let bogus = record(22, &handshake_msg(20, &[0; 12]));
        session.recv.capture(&bogus).unwrap();
        session.recv.update(&policy);
        assert_eq!(session.recv.interest(), Interest::Irrelevant);
        assert_eq!(session.recv.bytes_to_forward(), bogus.len());
    }

    #[test]
    fn sni_present() {
        let record = client_hello_record("intercept.example");
        let body = &record[TLS_RECORD_HEADER_SIZE + HANDSHAKE_HEADER_SIZE..];
        assert_eq!(parse_sni(body), Some("intercept.example".to_owned()));
    }

    #[test]
    fn sni_absent_or_malformed() {
        // Too short for even the fixed prefix.
        assert_eq!(parse_sni(&[0; 10]), None);
        // Valid prefix, no extensions block.
        let mut body = vec![3, 3];
        body.extend_from_slice(&[0; 32]);
        body.push(0); // empty session id
        body.extend_from_slice(&[0, 2, 0, 0x2f]); // one cipher suite
        body.extend_from_slice(&[1, 0]); // null compression
        assert_eq!(parse_sni(&body), None);
        // Truncated extension length.
        body.extend_from_slice(&[0, 8, 0, 0, 0, 20]);
        assert_eq!(parse_sni(&body), None);
    }
}
