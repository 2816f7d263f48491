//! Submission interface toward the out-of-band policy engine.

/// Trust verdict rendered by the policy engine for one connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    /// The presented identity is acceptable; the handshake proceeds.
    Valid,
    /// The presented identity is rejected; the connection is terminated
    /// with a substitute payload.
    Invalid,
    /// The engine declines to judge; treated as acceptance.
    Abstain,
    /// The engine failed internally; treated as acceptance.
    Error,
}

/// Evidence collected from a single connection's handshake.
///
/// `client_hello` and `server_hello` are complete handshake messages
/// including their four-byte message headers; `chain` is the body of the
/// `Certificate` message exactly as seen on the wire.
#[derive(Debug)]
pub struct Query<'a> {
    pub pid: u32,
    pub fd: u32,
    /// SNI hostname from the `ClientHello`, or the peer address when the
    /// extension is absent or malformed.
    pub hostname: &'a str,
    pub port: u16,
    pub chain: &'a [u8],
    pub client_hello: &'a [u8],
    pub server_hello: &'a [u8],
}

/// The out-of-band decision engine.
///
/// Submission is fire-and-forget from the parser's perspective: the call
/// runs synchronously on the hooked thread and must not call back into
/// the interceptor.
pub trait PolicyEngine: Send + Sync {
    fn poll_schemes(&self, query: Query) -> Verdict;
}
