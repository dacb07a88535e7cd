//! Worker threads: a private reactor per worker and the connection state
//! machine driving every connection assigned to it.
//!
//! The machine loops without yielding as long as transitions are internally
//! satisfiable; it returns to the reactor only when a syscall would block,
//! the per-event request budget runs out, or the connection is done.

use crate::protocol::handler;
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{ConnFreelist, ConnShell, ConnState, Connection, Transport};
use crate::runtime::reply::{Transmit, UDP_HEADER_SIZE};
use crate::runtime::{Handoff, ServerCtx, WAKER_TOKEN};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything a command handler may touch, threaded through the state
/// machine.
pub struct WorkerCtx<'a> {
    pub srv: &'a ServerCtx,
    pub pool: &'a mut BufferPool,
    /// This worker's stats slot.
    pub thread: usize,
}

pub struct Worker {
    id: usize,
    poll: Poll,
    conns: Slab<Connection>,
    pool: BufferPool,
    freelist: ConnFreelist,
    rx: Receiver<Handoff>,
    srv: ServerCtx,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        id: usize,
        poll: Poll,
        rx: Receiver<Handoff>,
        srv: ServerCtx,
        shutdown: Arc<AtomicBool>,
        udp: Option<(mio::net::UdpSocket, socket2::Socket)>,
    ) -> io::Result<Worker> {
        let per_worker_buffer_bytes =
            srv.settings.max_conn_buffer_bytes / srv.settings.num_workers.max(1);
        let pool = BufferPool::new(per_worker_buffer_bytes, srv.pools.group(id));
        let maxconns = srv.settings.maxconns;

        let mut worker = Worker {
            id,
            poll,
            conns: Slab::new(),
            pool,
            freelist: ConnFreelist::new(maxconns),
            rx,
            srv,
            shutdown,
        };

        if let Some((rx_sock, tx_sock)) = udp {
            let entry = worker.conns.vacant_entry();
            let token = Token(entry.key());
            let mut conn = Connection::new(
                Transport::Udp {
                    rx: rx_sock,
                    tx: tx_sock,
                },
                token,
                ConnState::Reading,
                None,
                ConnShell::fresh(),
            );
            conn.register(worker.poll.registry(), Interest::READABLE)?;
            entry.insert(conn);
        }

        Ok(worker)
    }

    fn stats_slot(&self) -> usize {
        self.id + 1
    }

    pub fn run(mut self) {
        info!(worker = self.id, "worker started");
        let mut events = Events::with_capacity(256);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.id, error = %e, "poll failed");
                return;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.accept_handoffs(),
                    Token(key) => self.handle_event(key),
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                debug!(worker = self.id, "worker shutting down");
                return;
            }
        }
    }

    /// Register connections the dispatcher handed over.
    fn accept_handoffs(&mut self) {
        while let Ok(handoff) = self.rx.try_recv() {
            let (shell, recycled) = self.freelist.take();
            let (transport, peer) = match handoff {
                Handoff::Tcp(stream, addr) => (Transport::Tcp(stream), Some(addr)),
                Handoff::Unix(stream) => (Transport::Unix(stream), None),
            };

            let stats_slot = self.stats_slot();
            let entry = self.conns.vacant_entry();
            let token = Token(entry.key());
            let mut conn = Connection::new(transport, token, ConnState::Reading, peer, shell);

            match conn.register(self.poll.registry(), Interest::READABLE) {
                Ok(()) => {
                    {
                        let mut st = self.srv.stats.slot(stats_slot);
                        st.curr_conns += 1;
                        st.total_conns += 1;
                        if !recycled {
                            st.conn_structs += 1;
                        }
                    }
                    debug!(worker = self.id, conn_id = token.0, "new client connection");
                    entry.insert(conn);
                }
                Err(e) => {
                    warn!(worker = self.id, error = %e, "failed to register connection");
                    self.srv.shared.conn_closed();
                }
            }
        }
    }

    fn handle_event(&mut self, key: usize) {
        if !self.conns.contains(key) {
            return;
        }

        let written = {
            let conn = &mut self.conns[key];
            let mut ctx = WorkerCtx {
                srv: &self.srv,
                pool: &mut self.pool,
                thread: self.id + 1,
            };
            drive_machine(&mut ctx, conn, self.poll.registry());
            std::mem::take(&mut conn.bytes_written_pending)
        };
        if written > 0 {
            self.srv.stats.slot(self.stats_slot()).bytes_written += written;
        }

        if self.conns[key].state == ConnState::Closing {
            if self.conns[key].is_datagram() {
                self.reset_datagram_conn(key);
            } else {
                self.close_connection(key);
            }
        }
    }

    /// A datagram connection is the worker's shared socket; it is never torn
    /// down, just reset to wait for the next datagram.
    fn reset_datagram_conn(&mut self, key: usize) {
        let conn = &mut self.conns[key];
        conn.reset_reply();
        conn.release_read_buffer(&mut self.pool);
        conn.pending = None;
        conn.sbytes = 0;
        conn.state = ConnState::Reading;
        conn.update_event(self.poll.registry(), Interest::READABLE);
    }

    fn close_connection(&mut self, key: usize) {
        let mut conn = self.conns.remove(key);
        conn.deregister(self.poll.registry());
        debug!(worker = self.id, conn_id = key, "connection closed");

        if let Some(shell) = conn.into_shell(&mut self.pool) {
            self.freelist.put(shell);
        }
        self.srv.stats.slot(self.stats_slot()).curr_conns -= 1;
        self.srv.shared.conn_closed();
    }
}

enum ReadOutcome {
    Got(usize),
    Eof,
    WouldBlock,
    Error,
}

/// Run one connection until it blocks, exhausts its request budget, or
/// reaches a terminal state.
pub fn drive_machine(w: &mut WorkerCtx<'_>, conn: &mut Connection, registry: &Registry) {
    let mut stop = false;
    let mut nreqs = w.srv.settings.reqs_per_event;

    while !stop {
        match conn.state {
            ConnState::Reading => {
                if try_read_command(conn, w) {
                    continue;
                }
                /* if the request budget allows, pull more bytes; otherwise
                 * yield so other connections get a turn */
                let got = if nreqs == 0 {
                    false
                } else if conn.is_datagram() {
                    try_read_udp(conn, w)
                } else {
                    try_read_network(conn, w)
                };
                if got {
                    nreqs -= 1;
                    continue;
                }
                if conn.state != ConnState::Reading {
                    continue;
                }
                if !conn.update_event(registry, Interest::READABLE) {
                    conn.set_state(ConnState::Closing, w.pool);
                    continue;
                }
                stop = true;
            }

            ConnState::ReadValue => {
                enum Step {
                    Complete,
                    Copied,
                    NeedSocket,
                    Broken,
                }
                let step = {
                    let Connection {
                        ref mut pending,
                        ref rbuf,
                        ref mut rcurr,
                        ref mut rbytes,
                        ..
                    } = *conn;
                    match pending.as_mut() {
                        None => Step::Broken,
                        Some(p) if p.filled == p.body.len() => Step::Complete,
                        Some(p) if *rbytes > 0 => {
                            /* value bytes already buffered with the command */
                            let n = (*rbytes).min(p.body.len() - p.filled);
                            match rbuf.as_ref() {
                                Some(buf) => {
                                    p.body[p.filled..p.filled + n]
                                        .copy_from_slice(&buf[*rcurr..*rcurr + n]);
                                    p.filled += n;
                                    *rcurr += n;
                                    *rbytes -= n;
                                    Step::Copied
                                }
                                None => Step::Broken,
                            }
                        }
                        Some(_) => Step::NeedSocket,
                    }
                };

                match step {
                    Step::Complete => handler::complete_nread(conn, w),
                    Step::Copied => {}
                    Step::Broken => conn.set_state(ConnState::Closing, w.pool),
                    Step::NeedSocket => {
                        let outcome = {
                            let Connection {
                                ref mut transport,
                                ref mut pending,
                                ..
                            } = *conn;
                            match pending.as_mut() {
                                Some(p) => match transport.read(&mut p.body[p.filled..]) {
                                    Ok(0) => ReadOutcome::Eof,
                                    Ok(n) => {
                                        p.filled += n;
                                        ReadOutcome::Got(n)
                                    }
                                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                        ReadOutcome::WouldBlock
                                    }
                                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                                        ReadOutcome::Got(0)
                                    }
                                    Err(_) => ReadOutcome::Error,
                                },
                                None => ReadOutcome::Error,
                            }
                        };
                        match outcome {
                            ReadOutcome::Got(n) => {
                                w.srv.stats.slot(w.thread).bytes_read += n as u64;
                            }
                            ReadOutcome::Eof | ReadOutcome::Error => {
                                conn.set_state(ConnState::Closing, w.pool)
                            }
                            ReadOutcome::WouldBlock => {
                                if !conn.update_event(registry, Interest::READABLE) {
                                    conn.set_state(ConnState::Closing, w.pool);
                                    continue;
                                }
                                stop = true;
                            }
                        }
                    }
                }
            }

            ConnState::Swallow => {
                if conn.sbytes == 0 {
                    conn.set_state(ConnState::Reading, w.pool);
                    continue;
                }
                if conn.rbytes > 0 {
                    let tocopy = conn.rbytes.min(conn.sbytes);
                    conn.sbytes -= tocopy;
                    conn.rcurr += tocopy;
                    conn.rbytes -= tocopy;
                    continue;
                }
                if conn.rbuf.is_none() {
                    match w.pool.acquire() {
                        Some(buf) => {
                            conn.rbuf = Some(buf);
                            conn.rcurr = 0;
                        }
                        None => {
                            conn.set_state(ConnState::Closing, w.pool);
                            continue;
                        }
                    }
                }

                let outcome = {
                    let Connection {
                        ref mut transport,
                        ref mut rbuf,
                        ref sbytes,
                        ..
                    } = *conn;
                    match rbuf.as_mut() {
                        Some(buf) => {
                            let len = buf.len().min(*sbytes);
                            match transport.read(&mut buf[..len]) {
                                Ok(0) => ReadOutcome::Eof,
                                Ok(n) => ReadOutcome::Got(n),
                                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                    ReadOutcome::WouldBlock
                                }
                                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                                    ReadOutcome::Got(0)
                                }
                                Err(_) => ReadOutcome::Error,
                            }
                        }
                        None => ReadOutcome::Error,
                    }
                };
                match outcome {
                    ReadOutcome::Got(n) => {
                        conn.sbytes -= n;
                        w.srv.stats.slot(w.thread).bytes_read += n as u64;
                    }
                    ReadOutcome::Eof | ReadOutcome::Error => {
                        conn.set_state(ConnState::Closing, w.pool)
                    }
                    ReadOutcome::WouldBlock => {
                        if !conn.update_event(registry, Interest::READABLE) {
                            conn.set_state(ConnState::Closing, w.pool);
                            continue;
                        }
                        stop = true;
                    }
                }
            }

            ConnState::Write | ConnState::WriteMulti => {
                /* a simple response still needs its one-message list */
                if conn.state == ConnState::Write
                    && conn.iovused == 0
                    && !conn.assemble_simple_response()
                {
                    conn.set_state(ConnState::Closing, w.pool);
                    continue;
                }

                match conn.transmit() {
                    Transmit::Complete => {
                        if conn.state == ConnState::WriteMulti {
                            /* entering Reading drops the segments, releasing
                             * every held item reference */
                            conn.set_state(ConnState::Reading, w.pool);
                        } else {
                            conn.scratch = None;
                            conn.reset_reply();
                            let next = conn.write_and_go;
                            conn.set_state(next, w.pool);
                        }
                    }
                    Transmit::Incomplete => {}
                    Transmit::SoftError => {
                        if !conn.update_event(registry, Interest::WRITABLE) {
                            conn.set_state(ConnState::Closing, w.pool);
                            continue;
                        }
                        stop = true;
                    }
                    Transmit::HardError => {
                        if conn.is_datagram() {
                            /* drop the datagram, wait for the next one */
                            conn.set_state(ConnState::Reading, w.pool);
                        } else {
                            conn.set_state(ConnState::Closing, w.pool);
                        }
                    }
                }
            }

            ConnState::Closing => {
                stop = true;
            }
        }
    }
}

/// If a complete command line is buffered, dispatch it.
fn try_read_command(conn: &mut Connection, w: &mut WorkerCtx<'_>) -> bool {
    let line = {
        let buf = match conn.rbuf.as_ref() {
            Some(buf) => buf,
            None => return false,
        };
        if conn.rbytes == 0 {
            return false;
        }
        let window = &buf[conn.rcurr..conn.rcurr + conn.rbytes];
        let nl = match window.iter().position(|&b| b == b'\n') {
            Some(nl) => nl,
            None => return false,
        };
        let mut end = nl;
        if end > 1 && window[end - 1] == b'\r' {
            end -= 1;
        }
        let line = window[..end].to_vec();
        conn.rcurr += nl + 1;
        conn.rbytes -= nl + 1;
        line
    };

    handler::process_command(conn, w, &line);
    true
}

/// Read as much as the stream will give. Compacts any partial command to the
/// front of the buffer first. Returns whether the machine made progress.
fn try_read_network(conn: &mut Connection, w: &mut WorkerCtx<'_>) -> bool {
    if conn.rbuf.is_some() {
        if conn.rcurr != 0 {
            if conn.rbytes != 0 {
                let (rcurr, rbytes) = (conn.rcurr, conn.rbytes);
                if let Some(buf) = conn.rbuf.as_mut() {
                    buf.copy_within(rcurr..rcurr + rbytes, 0);
                }
            }
            conn.rcurr = 0;
        }
    } else {
        match w.pool.acquire() {
            Some(buf) => {
                conn.rbuf = Some(buf);
                conn.rcurr = 0;
                conn.rbytes = 0;
            }
            None => {
                conn.out_string("SERVER_ERROR out of memory");
                return true;
            }
        }
    }

    let mut gotdata = false;
    loop {
        let (outcome, avail) = {
            let Connection {
                ref mut transport,
                ref mut rbuf,
                ref rbytes,
                ..
            } = *conn;
            match rbuf.as_mut() {
                Some(buf) => {
                    let avail = buf.len() - rbytes;
                    (transport.read(&mut buf[*rbytes..]), avail)
                }
                None => return gotdata,
            }
        };

        match outcome {
            Ok(0) => {
                /* connection closed, or the line outgrew the buffer */
                conn.set_state(ConnState::Closing, w.pool);
                return true;
            }
            Ok(n) => {
                w.srv.stats.slot(w.thread).bytes_read += n as u64;
                gotdata = true;
                conn.rbytes += n;
                w.pool.report_peak(conn.rbytes);
                if n < avail {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if conn.rbytes == 0 {
                    /* idle connections hold no read memory */
                    conn.release_read_buffer(w.pool);
                }
                break;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "read failed");
                conn.set_state(ConnState::Closing, w.pool);
                return true;
            }
        }
    }
    gotdata
}

enum UdpRead {
    Datagram(usize),
    MultiPacket(usize),
    Empty,
}

/// Receive one datagram, strip its 8-byte header, and stage it as the read
/// buffer. Multi-packet requests are rejected.
fn try_read_udp(conn: &mut Connection, w: &mut WorkerCtx<'_>) -> bool {
    /* every datagram stands alone */
    conn.rcurr = 0;
    conn.rbytes = 0;

    if conn.rbuf.is_none() {
        match w.pool.acquire() {
            Some(buf) => conn.rbuf = Some(buf),
            None => {
                conn.out_string("SERVER_ERROR out of memory");
                return true;
            }
        }
    }

    let outcome = {
        let Connection {
            ref mut transport,
            ref mut rbuf,
            ref mut peer,
            ref mut request_id,
            ..
        } = *conn;
        let rx = match transport {
            Transport::Udp { rx, .. } => rx,
            _ => return false,
        };
        match rbuf.as_mut() {
            Some(buf) => match rx.recv_from(buf) {
                Ok((res, from)) if res > UDP_HEADER_SIZE => {
                    *peer = Some(from);
                    *request_id = u16::from_be_bytes([buf[0], buf[1]]);
                    if buf[4] != 0 || buf[5] != 1 {
                        UdpRead::MultiPacket(res)
                    } else {
                        buf.copy_within(UDP_HEADER_SIZE..res, 0);
                        UdpRead::Datagram(res)
                    }
                }
                /* runt datagrams and transient errors: drop and keep
                 * listening */
                Ok(_) => UdpRead::Empty,
                Err(_) => UdpRead::Empty,
            },
            None => UdpRead::Empty,
        }
    };

    match outcome {
        UdpRead::Datagram(res) => {
            w.srv.stats.slot(w.thread).bytes_read += res as u64;
            w.pool.report_peak(res);
            conn.rbytes = res - UDP_HEADER_SIZE;
            true
        }
        UdpRead::MultiPacket(res) => {
            w.srv.stats.slot(w.thread).bytes_read += res as u64;
            conn.out_string("SERVER_ERROR multi-packet request not supported");
            true
        }
        UdpRead::Empty => {
            conn.release_read_buffer(w.pool);
            false
        }
    }
}
