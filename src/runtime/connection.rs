//! Per-connection state.
//!
//! A `Connection` owns its socket, buffers, reply assembly state, and the
//! cursors the state machine suspends on. Closed stream connections donate
//! their grown allocations back to a bounded per-worker freelist so accept
//! churn does not turn into allocator churn.

use crate::runtime::buffer::BufferPool;
use crate::runtime::reply::MsgHeader;
use crate::storage::StorePolicy;
use mio::net::{TcpStream, UdpSocket, UnixStream};
use mio::{Interest, Registry, Token};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Initial (and post-shrink) write buffer capacity.
pub const DATA_BUFFER_SIZE: usize = 2048;
/// Write buffers above this are shrunk between requests.
pub const WRITE_BUFFER_HIGHWAT: usize = 8192;
/// Initial message-list capacity.
pub const MSG_LIST_INITIAL: usize = 10;
/// Message lists above this are shrunk between requests.
pub const MSG_LIST_HIGHWAT: usize = 100;
/// Longest reply line `out_string` will emit.
pub const OUT_LINE_MAX: usize = 16 * 1024;

/// The socket a connection reads from and replies on.
///
/// Datagram connections share the worker's receive socket and reply on the
/// worker's own transmit socket so sends do not contend on one fd.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp { rx: UdpSocket, tx: socket2::Socket },
}

impl Transport {
    pub fn is_datagram(&self) -> bool {
        matches!(self, Transport::Udp { .. })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
            Transport::Udp { rx, .. } => rx.recv(buf),
        }
    }
}

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Parsing buffered command lines, reading more when there are none.
    Reading,
    /// Reading a store command's value body.
    ReadValue,
    /// Discarding a value body after a failed store.
    Swallow,
    /// One pre-built response line in the write buffer.
    Write,
    /// Draining the queued reply messages.
    WriteMulti,
    /// Tear the connection down.
    Closing,
}

/// A store command waiting for its value body (`<data>\r\n`).
pub struct PendingStore {
    pub policy: StorePolicy,
    pub key: Vec<u8>,
    pub flags: u32,
    pub exptime: u32,
    pub vlen: usize,
    /// `vlen + 2` bytes: the value and its trailing CRLF.
    pub body: Vec<u8>,
    pub filled: usize,
}

/// Reusable allocations salvaged from a closed connection.
pub struct ConnShell {
    wbuf: Vec<u8>,
    msgs: Vec<MsgHeader>,
}

impl ConnShell {
    pub fn fresh() -> ConnShell {
        ConnShell {
            wbuf: Vec::with_capacity(DATA_BUFFER_SIZE),
            msgs: Vec::with_capacity(MSG_LIST_INITIAL),
        }
    }
}

/// Bounded freelist of connection shells, grown geometrically up to a cap.
pub struct ConnFreelist {
    shells: Vec<ConnShell>,
    cap: usize,
}

impl ConnFreelist {
    pub fn new(cap: usize) -> ConnFreelist {
        ConnFreelist {
            shells: Vec::new(),
            cap,
        }
    }

    /// Take a shell, allocating a fresh one when the list is empty. Returns
    /// whether the shell came from the freelist.
    pub fn take(&mut self) -> (ConnShell, bool) {
        match self.shells.pop() {
            Some(shell) => (shell, true),
            None => (ConnShell::fresh(), false),
        }
    }

    pub fn put(&mut self, shell: ConnShell) {
        if self.shells.len() < self.cap {
            self.shells.push(shell);
        }
    }
}

pub struct Connection {
    pub transport: Transport,
    pub token: Token,
    pub state: ConnState,
    /// State to enter once a `Write` response has drained.
    pub write_and_go: ConnState,
    interest: Option<Interest>,

    /// Lazily acquired page-sized read buffer.
    pub rbuf: Option<Vec<u8>>,
    pub rcurr: usize,
    pub rbytes: usize,

    /// Reply arena; segments reference ranges of it by offset.
    pub wbuf: Vec<u8>,
    /// Start of the simple-response region within `wbuf`.
    pub wcurr: usize,

    pub msgs: Vec<MsgHeader>,
    pub msgcurr: usize,
    /// Segments queued across all messages.
    pub iovused: usize,

    /// Free-on-completion reply storage (stats dumps).
    pub scratch: Option<Vec<u8>>,

    pub pending: Option<PendingStore>,
    /// Bytes left to discard in `Swallow`.
    pub sbytes: usize,

    /// Datagram origin, or the stream peer address.
    pub peer: Option<SocketAddr>,
    /// Datagram request fingerprint, echoed in every reply header.
    pub request_id: u16,

    /// Managed-mode request tag; -1 when untagged.
    pub bucket: i32,
    pub gen: u32,

    /// Bytes written since the state machine last reported to stats.
    pub bytes_written_pending: u64,
}

impl Connection {
    pub fn new(
        transport: Transport,
        token: Token,
        state: ConnState,
        peer: Option<SocketAddr>,
        shell: ConnShell,
    ) -> Connection {
        Connection {
            transport,
            token,
            state,
            write_and_go: ConnState::Reading,
            interest: None,
            rbuf: None,
            rcurr: 0,
            rbytes: 0,
            wbuf: shell.wbuf,
            wcurr: 0,
            msgs: shell.msgs,
            msgcurr: 0,
            iovused: 0,
            scratch: None,
            pending: None,
            sbytes: 0,
            peer,
            request_id: 0,
            bucket: -1,
            gen: 0,
            bytes_written_pending: 0,
        }
    }

    pub fn is_datagram(&self) -> bool {
        self.transport.is_datagram()
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer.map(|addr| addr.ip())
    }

    /// Drop all queued reply state. Segments own their item references and
    /// scratch ranges, so clearing them is the release.
    pub fn reset_reply(&mut self) {
        self.msgs.clear();
        self.msgcurr = 0;
        self.iovused = 0;
        self.scratch = None;
    }

    /// Transition states, applying entry actions. All transitions go through
    /// here or through the reply helpers that enter `Write`.
    pub fn set_state(&mut self, state: ConnState, pool: &mut BufferPool) {
        if state == self.state {
            return;
        }
        if state == ConnState::Reading {
            self.reset_reply();
            self.wcurr = 0;
            if self.wbuf.capacity() > WRITE_BUFFER_HIGHWAT {
                self.wbuf = Vec::with_capacity(DATA_BUFFER_SIZE);
            } else {
                self.wbuf.clear();
            }
            self.shrink(pool);
        }
        self.state = state;
    }

    /// Shrink buffers that outgrew their high-water marks and compact or
    /// release the read buffer. Only called between requests since it wipes
    /// reply state.
    fn shrink(&mut self, pool: &mut BufferPool) {
        if self.msgs.capacity() > MSG_LIST_HIGHWAT {
            self.msgs = Vec::with_capacity(MSG_LIST_INITIAL);
        }

        /* a datagram connection may still hold the unparsed tail of the
         * current datagram; the next receive resets the buffer anyway */
        if self.is_datagram() {
            return;
        }

        if self.rbytes == 0 {
            self.release_read_buffer(pool);
        } else if let Some(rbuf) = &mut self.rbuf {
            /* move the unread tail to the front */
            rbuf.copy_within(self.rcurr..self.rcurr + self.rbytes, 0);
            self.rcurr = 0;
        }
    }

    pub fn release_read_buffer(&mut self, pool: &mut BufferPool) {
        if let Some(buf) = self.rbuf.take() {
            pool.release(buf, self.rcurr + self.rbytes);
        }
        self.rcurr = 0;
        self.rbytes = 0;
    }

    /// Re-arm the reactor registration, idempotent when the interest is
    /// unchanged. Returns false if the registry refused.
    pub fn update_event(&mut self, registry: &Registry, interest: Interest) -> bool {
        if self.interest == Some(interest) {
            return true;
        }
        let token = self.token;
        let res = match &mut self.transport {
            Transport::Tcp(s) => registry.reregister(s, token, interest),
            Transport::Unix(s) => registry.reregister(s, token, interest),
            Transport::Udp { rx, .. } => registry.reregister(rx, token, interest),
        };
        match res {
            Ok(()) => {
                self.interest = Some(interest);
                true
            }
            Err(e) => {
                debug!(error = %e, "reregister failed");
                false
            }
        }
    }

    pub fn register(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        let token = self.token;
        match &mut self.transport {
            Transport::Tcp(s) => registry.register(s, token, interest)?,
            Transport::Unix(s) => registry.register(s, token, interest)?,
            Transport::Udp { rx, .. } => registry.register(rx, token, interest)?,
        }
        self.interest = Some(interest);
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = match &mut self.transport {
            Transport::Tcp(s) => registry.deregister(s),
            Transport::Unix(s) => registry.deregister(s),
            Transport::Udp { rx, .. } => registry.deregister(rx),
        };
        self.interest = None;
    }

    /// Tear down reply state and held buffers, returning a reusable shell
    /// unless the buffers grew past their high-water marks.
    pub fn into_shell(mut self, pool: &mut BufferPool) -> Option<ConnShell> {
        self.reset_reply();
        self.release_read_buffer(pool);
        self.pending = None;

        if self.wbuf.capacity() > WRITE_BUFFER_HIGHWAT || self.msgs.capacity() > MSG_LIST_HIGHWAT {
            return None;
        }
        let mut wbuf = std::mem::take(&mut self.wbuf);
        wbuf.clear();
        let mut msgs = std::mem::take(&mut self.msgs);
        msgs.clear();
        Some(ConnShell { wbuf, msgs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::PoolGroupStats;
    use std::sync::Arc;

    fn test_pool() -> BufferPool {
        BufferPool::new(1 << 20, Arc::new(PoolGroupStats::default()))
    }

    fn stream_conn() -> Connection {
        // a socket that never sees traffic; state logic only
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        Connection::new(
            Transport::Tcp(TcpStream::from_std(stream)),
            Token(1),
            ConnState::Reading,
            Some(addr),
            ConnShell::fresh(),
        )
    }

    #[test]
    fn entering_reading_resets_reply_state() {
        let mut pool = test_pool();
        let mut conn = stream_conn();

        conn.state = ConnState::WriteMulti;
        conn.add_msghdr();
        conn.wbuf.extend_from_slice(b"VALUE ...");
        assert_eq!(conn.msgs.len(), 1);

        conn.set_state(ConnState::Reading, &mut pool);
        assert!(conn.msgs.is_empty());
        assert_eq!(conn.iovused, 0);
        assert_eq!(conn.msgcurr, 0);
        assert!(conn.wbuf.is_empty());
    }

    #[test]
    fn shrink_compacts_the_read_tail() {
        let mut pool = test_pool();
        let mut conn = stream_conn();
        conn.state = ConnState::WriteMulti;

        let mut rbuf = pool.acquire().unwrap();
        rbuf[..10].copy_from_slice(b"0123456789");
        conn.rbuf = Some(rbuf);
        conn.rcurr = 6;
        conn.rbytes = 4;

        conn.set_state(ConnState::Reading, &mut pool);
        assert_eq!(conn.rcurr, 0);
        assert_eq!(conn.rbytes, 4);
        assert_eq!(&conn.rbuf.as_ref().unwrap()[..4], b"6789");
    }

    #[test]
    fn shrink_releases_an_empty_read_buffer() {
        let mut pool = test_pool();
        let mut conn = stream_conn();
        conn.state = ConnState::Write;

        conn.rbuf = Some(pool.acquire().unwrap());
        conn.set_state(ConnState::Reading, &mut pool);
        assert!(conn.rbuf.is_none());
    }

    #[test]
    fn oversized_write_buffers_shrink_between_requests() {
        let mut pool = test_pool();
        let mut conn = stream_conn();
        conn.state = ConnState::Write;
        conn.wbuf = Vec::with_capacity(WRITE_BUFFER_HIGHWAT * 2);

        conn.set_state(ConnState::Reading, &mut pool);
        assert!(conn.wbuf.capacity() <= WRITE_BUFFER_HIGHWAT);
    }

    #[test]
    fn freelist_is_bounded() {
        let mut freelist = ConnFreelist::new(2);
        freelist.put(ConnShell::fresh());
        freelist.put(ConnShell::fresh());
        freelist.put(ConnShell::fresh());
        assert!(freelist.take().1);
        assert!(freelist.take().1);
        assert!(!freelist.take().1);
    }

    #[test]
    fn grown_connections_are_not_recycled() {
        let mut pool = test_pool();
        let conn = stream_conn();
        assert!(conn.into_shell(&mut pool).is_some());

        let mut conn = stream_conn();
        conn.wbuf = Vec::with_capacity(WRITE_BUFFER_HIGHWAT * 2);
        assert!(conn.into_shell(&mut pool).is_none());
    }
}
