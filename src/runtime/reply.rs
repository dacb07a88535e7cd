//! Reply assembly: scatter/gather segment lists, UDP datagram framing, and
//! the vectored transmit path.
//!
//! Replies are queued as messages, each a list of typed segments. A segment
//! names its backing store — static protocol text, a range of the
//! connection's write buffer, an item's key or value bytes, the
//! free-on-completion scratch buffer, or a message's own UDP header — so
//! every backing store provably outlives the send, and dropping the segment
//! releases it. Item segments hold the reference that pins the item.

use crate::runtime::connection::{ConnState, Connection, Transport, OUT_LINE_MAX};
use crate::storage::Item;
use socket2::SockAddr;
use std::io::{self, IoSlice, Write};
use std::sync::Arc;
use tracing::debug;

/// Every datagram starts with request id, sequence number, sequence count,
/// and the offset of the first response line, two big-endian bytes each.
pub const UDP_HEADER_SIZE: usize = 8;
/// Ceiling on a datagram, header included. The first message of a stream
/// reply honors it too.
pub const UDP_MAX_PAYLOAD_SIZE: usize = 1400;
/// Segments per message before a new message is opened.
pub const MSG_IOV_MAX: usize = 1024;
/// Segments across an entire reply.
pub const TOTAL_IOV_LIMIT: usize = 4096;

/// One outbound byte range and the storage backing it.
#[derive(Debug, Clone)]
pub enum Segment {
    Static {
        bytes: &'static [u8],
        off: usize,
        len: usize,
    },
    /// Range of the connection's write buffer.
    WriteBuf { off: usize, len: usize },
    /// Range of an item's key; the `Arc` pins the item.
    ItemKey {
        item: Arc<Item>,
        off: usize,
        len: usize,
    },
    /// Range of an item's value; the `Arc` pins the item.
    ItemValue {
        item: Arc<Item>,
        off: usize,
        len: usize,
    },
    /// Range of the free-on-completion scratch buffer.
    Scratch { off: usize, len: usize },
    /// The owning message's 8-byte datagram header.
    UdpHeader { off: usize, len: usize },
}

impl Segment {
    pub fn item_value(item: Arc<Item>) -> Segment {
        let len = item.data().len();
        Segment::ItemValue { item, off: 0, len }
    }

    pub fn item_key(item: Arc<Item>) -> Segment {
        let len = item.key().len();
        Segment::ItemKey { item, off: 0, len }
    }

    pub fn fixed(bytes: &'static [u8]) -> Segment {
        Segment::Static {
            bytes,
            off: 0,
            len: bytes.len(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Segment::Static { len, .. }
            | Segment::WriteBuf { len, .. }
            | Segment::ItemKey { len, .. }
            | Segment::ItemValue { len, .. }
            | Segment::Scratch { len, .. }
            | Segment::UdpHeader { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume `n` bytes from the front.
    fn advance(&mut self, n: usize) {
        match self {
            Segment::Static { off, len, .. }
            | Segment::WriteBuf { off, len }
            | Segment::ItemKey { off, len, .. }
            | Segment::ItemValue { off, len, .. }
            | Segment::Scratch { off, len }
            | Segment::UdpHeader { off, len } => {
                debug_assert!(n <= *len);
                *off += n;
                *len -= n;
            }
        }
    }

    /// Split off the first `n` bytes as their own segment.
    fn take_prefix(&mut self, n: usize) -> Segment {
        let mut head = self.clone();
        match &mut head {
            Segment::Static { len, .. }
            | Segment::WriteBuf { len, .. }
            | Segment::ItemKey { len, .. }
            | Segment::ItemValue { len, .. }
            | Segment::Scratch { len, .. }
            | Segment::UdpHeader { len, .. } => *len = n,
        }
        self.advance(n);
        head
    }

    /// Resolve to the bytes it names. `wbuf`, `scratch`, and `hdr` are the
    /// connection write buffer, scratch buffer, and owning message's UDP
    /// header.
    fn resolve<'a>(
        &'a self,
        wbuf: &'a [u8],
        scratch: Option<&'a [u8]>,
        hdr: &'a [u8; UDP_HEADER_SIZE],
    ) -> &'a [u8] {
        match self {
            Segment::Static { bytes, off, len } => &bytes[*off..*off + *len],
            Segment::WriteBuf { off, len } => &wbuf[*off..*off + *len],
            Segment::ItemKey { item, off, len } => &item.key()[*off..*off + *len],
            Segment::ItemValue { item, off, len } => &item.data()[*off..*off + *len],
            Segment::Scratch { off, len } => {
                let scratch = scratch.expect("scratch segment without scratch buffer");
                &scratch[*off..*off + *len]
            }
            Segment::UdpHeader { off, len } => &hdr[*off..*off + *len],
        }
    }
}

/// One contiguous write unit: a datagram, or a chunk of a stream reply.
#[derive(Debug, Default)]
pub struct MsgHeader {
    pub segs: Vec<Segment>,
    /// First segment transmit has not finished.
    pub cursor: usize,
    /// Queued bytes, datagram header included.
    pub bytes: usize,
    /// Index of the first response-start segment, for the datagram header's
    /// offset field.
    pub start_seg: Option<usize>,
    pub udp_hdr: [u8; UDP_HEADER_SIZE],
}

impl MsgHeader {
    fn done(&self) -> bool {
        self.cursor >= self.segs.len()
    }
}

/// The reply has more segments queued than the connection may hold.
#[derive(Debug, PartialEq, Eq)]
pub struct IovLimitError;

/// Outcome of one `transmit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    /// All queued messages written.
    Complete,
    /// Wrote some; call again.
    Incomplete,
    /// Would block; arm writable and yield.
    SoftError,
    /// Unrecoverable; drop the datagram or close the stream.
    HardError,
}

impl Connection {
    /// Open a new outbound message. Datagram messages reserve their header
    /// space up front.
    pub fn add_msghdr(&mut self) {
        let mut msg = MsgHeader::default();
        if self.is_datagram() {
            msg.segs.push(Segment::UdpHeader {
                off: 0,
                len: UDP_HEADER_SIZE,
            });
            msg.bytes = UDP_HEADER_SIZE;
            self.iovused += 1;
        }
        self.msgs.push(msg);
    }

    /// Queue one data segment, opening new messages at the segment cap and —
    /// for datagrams and the first stream message — at the payload limit,
    /// splitting the segment when it crosses the boundary.
    ///
    /// `is_start` marks the start of a top-level response line; the first
    /// such segment per message feeds the datagram header's offset field.
    pub fn add_iov(&mut self, mut seg: Segment, mut is_start: bool) -> Result<(), IovLimitError> {
        debug_assert!(!self.msgs.is_empty());
        let datagram = self.is_datagram();

        loop {
            let limit_to_mtu = datagram || self.msgs.len() == 1;

            {
                let m = self.msgs.last().expect("no open message");
                if m.segs.len() >= MSG_IOV_MAX
                    || (limit_to_mtu && m.bytes >= UDP_MAX_PAYLOAD_SIZE)
                {
                    self.add_msghdr();
                }
            }
            if self.iovused >= TOTAL_IOV_LIMIT {
                return Err(IovLimitError);
            }

            let m = self.msgs.last_mut().expect("no open message");
            let mut len = seg.len();
            if limit_to_mtu && m.bytes + len > UDP_MAX_PAYLOAD_SIZE {
                len = UDP_MAX_PAYLOAD_SIZE - m.bytes;
            }

            let part = seg.take_prefix(len);
            if datagram && is_start && m.start_seg.is_none() {
                m.start_seg = Some(m.segs.len());
            }
            m.bytes += len;
            m.segs.push(part);
            self.iovused += 1;
            is_start = false;

            if seg.is_empty() {
                return Ok(());
            }
        }
    }

    /// Fill in the 8-byte header of every queued datagram: request id,
    /// message index, message count, and the byte offset of the message's
    /// first response-start segment. Must run before the first transmit.
    pub fn build_udp_headers(&mut self) {
        let total = self.msgs.len() as u16;
        let rid = self.request_id;
        for (i, m) in self.msgs.iter_mut().enumerate() {
            let offset: usize = match m.start_seg.take() {
                Some(idx) => m.segs[..idx].iter().map(Segment::len).sum(),
                None => 0,
            };
            let i = i as u16;
            let offset = offset as u16;
            m.udp_hdr = [
                (rid >> 8) as u8,
                (rid & 0xff) as u8,
                (i >> 8) as u8,
                (i & 0xff) as u8,
                (total >> 8) as u8,
                (total & 0xff) as u8,
                (offset >> 8) as u8,
                (offset & 0xff) as u8,
            ];
        }
    }

    /// Write the next queued message with one vectored send. Partial writes
    /// consume finished segments and trim the first unfinished one.
    pub fn transmit(&mut self) -> Transmit {
        if self.msgcurr < self.msgs.len() && self.msgs[self.msgcurr].done() {
            /* finished writing the current msg; advance to the next */
            self.msgcurr += 1;
        }
        if self.msgcurr >= self.msgs.len() {
            return Transmit::Complete;
        }

        let msgcurr = self.msgcurr;
        let Connection {
            ref mut transport,
            ref wbuf,
            ref scratch,
            ref msgs,
            peer,
            ..
        } = *self;
        let m = &msgs[msgcurr];

        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(m.segs.len() - m.cursor);
        for seg in &m.segs[m.cursor..] {
            if !seg.is_empty() {
                slices.push(IoSlice::new(seg.resolve(
                    wbuf,
                    scratch.as_deref(),
                    &m.udp_hdr,
                )));
            }
        }

        let res = if slices.is_empty() {
            Ok(0)
        } else {
            match transport {
                Transport::Tcp(s) => s.write_vectored(&slices),
                Transport::Unix(s) => s.write_vectored(&slices),
                Transport::Udp { tx, .. } => {
                    let peer = match peer {
                        Some(addr) => addr,
                        None => return Transmit::HardError,
                    };
                    tx.send_to_vectored(&slices, &SockAddr::from(peer))
                }
            }
        };
        let had_payload = !slices.is_empty();
        drop(slices);

        match res {
            Ok(n) => {
                if had_payload && n == 0 {
                    return Transmit::HardError;
                }
                self.bytes_written_pending += n as u64;

                /* remove completed segments from the pending list, then trim
                 * the first incomplete one */
                let m = &mut self.msgs[self.msgcurr];
                let mut n = n;
                while m.cursor < m.segs.len() && n >= m.segs[m.cursor].len() {
                    n -= m.segs[m.cursor].len();
                    m.cursor += 1;
                }
                if n > 0 {
                    m.segs[m.cursor].advance(n);
                }
                Transmit::Incomplete
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Transmit::SoftError,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Transmit::Incomplete,
            Err(e) => {
                debug!(error = %e, "transmit failed");
                Transmit::HardError
            }
        }
    }

    /// Queue a single response line, replacing any queued reply.
    pub fn out_string(&mut self, line: &str) {
        debug_assert_eq!(self.msgcurr, 0);
        self.reset_reply();

        let line = if line.len() + 2 > OUT_LINE_MAX {
            "SERVER_ERROR output line too long"
        } else {
            line
        };

        self.wbuf.clear();
        self.wcurr = 0;
        self.wbuf.extend_from_slice(line.as_bytes());
        self.wbuf.extend_from_slice(b"\r\n");

        self.state = ConnState::Write;
        self.write_and_go = ConnState::Reading;
    }

    /// Queue a pre-rendered buffer to be written then freed (stats dumps).
    pub fn out_scratch(&mut self, buf: Vec<u8>) {
        debug_assert_eq!(self.msgcurr, 0);
        self.reset_reply();
        self.wbuf.clear();
        self.wcurr = 0;
        self.scratch = Some(buf);
        self.state = ConnState::Write;
        self.write_and_go = ConnState::Reading;
    }

    /// Assemble the `Write` state's single response into a message list.
    /// Returns false when the segment budget is exhausted.
    pub fn assemble_simple_response(&mut self) -> bool {
        debug_assert_eq!(self.iovused, 0);
        self.add_msghdr();
        let seg = match &self.scratch {
            Some(buf) => Segment::Scratch {
                off: 0,
                len: buf.len(),
            },
            None => Segment::WriteBuf {
                off: self.wcurr,
                len: self.wbuf.len() - self.wcurr,
            },
        };
        if self.add_iov(seg, true).is_err() {
            return false;
        }
        if self.is_datagram() {
            self.build_udp_headers();
        }
        self.msgcurr = 0;
        true
    }
}
