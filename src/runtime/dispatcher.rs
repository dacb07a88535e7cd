//! The dispatcher thread: owns the listening sockets, accepts connections,
//! and hands them round-robin to the workers. Also the home of the 1 Hz
//! clock tick and the 5-second deferred-delete sweep.

use crate::clock;
use crate::runtime::socket;
use crate::runtime::{Handoff, ServerCtx, WAKER_TOKEN};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Seconds between deferred-delete sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub enum ListenerSocket {
    Tcp(mio::net::TcpListener),
    Unix(mio::net::UnixListener),
}

/// One worker's hand-off channel and wake-up handle.
pub struct WorkerChannel {
    pub tx: Sender<Handoff>,
    pub waker: Arc<Waker>,
}

pub struct Dispatcher {
    poll: Poll,
    listeners: Vec<ListenerSocket>,
    workers: Vec<WorkerChannel>,
    next_worker: usize,
    srv: ServerCtx,
    shutdown: Arc<AtomicBool>,
    accepting: bool,
}

impl Dispatcher {
    pub fn new(
        poll: Poll,
        mut listeners: Vec<ListenerSocket>,
        workers: Vec<WorkerChannel>,
        srv: ServerCtx,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Dispatcher> {
        for (i, listener) in listeners.iter_mut().enumerate() {
            register_listener(poll.registry(), listener, Token(i))?;
        }
        Ok(Dispatcher {
            poll,
            listeners,
            workers,
            next_worker: 0,
            srv,
            shutdown,
            accepting: true,
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(64);
        let mut last_sweep = Instant::now();

        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(Duration::from_secs(1))) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            clock::set_current_time();
            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.srv.store.run_deferred_deletes(clock::current_time());
                last_sweep = Instant::now();
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.maybe_resume_accepting(),
                    Token(idx) => self.accept_loop(idx),
                }
            }
        }

        debug!("dispatcher shutting down");
        for worker in &self.workers {
            let _ = worker.waker.wake();
        }
        Ok(())
    }

    fn at_capacity(&self) -> bool {
        self.srv.shared.curr_conns.load(Ordering::SeqCst) >= self.srv.settings.maxconns
    }

    fn accept_loop(&mut self, idx: usize) {
        loop {
            if !self.accepting {
                return;
            }
            if self.at_capacity() {
                info!("connection limit reached, pausing accepts");
                self.pause_accepting();
                return;
            }

            let accepted = match &self.listeners[idx] {
                ListenerSocket::Tcp(listener) => listener.accept().map(|(stream, addr)| {
                    socket::tune_stream(&stream);
                    Handoff::Tcp(stream, addr)
                }),
                ListenerSocket::Unix(listener) => {
                    listener.accept().map(|(stream, _)| Handoff::Unix(stream))
                }
            };

            match accepted {
                Ok(handoff) => self.dispatch(handoff),
                Err(e) => {
                    if self.handle_accept_error(e) {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    /// Returns true when the accept loop should retry.
    fn handle_accept_error(&mut self, e: io::Error) -> bool {
        match e.kind() {
            io::ErrorKind::WouldBlock => false,
            io::ErrorKind::Interrupted => true,
            _ => {
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    warn!("too many open connections, pausing accepts");
                    self.pause_accepting();
                } else {
                    error!(error = %e, "accept failed");
                }
                false
            }
        }
    }

    fn dispatch(&mut self, handoff: Handoff) {
        self.srv.shared.curr_conns.fetch_add(1, Ordering::SeqCst);

        let worker = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.workers.len();

        if self.workers[worker].tx.send(handoff).is_err() {
            /* worker is gone; the stream drops and closes */
            self.srv.shared.conn_closed();
            return;
        }
        if let Err(e) = self.workers[worker].waker.wake() {
            warn!(worker, error = %e, "failed to wake worker");
        }
    }

    /// Stop watching the listeners until a close frees a slot.
    fn pause_accepting(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        self.srv.shared.accept_paused.store(true, Ordering::SeqCst);
        for listener in &mut self.listeners {
            deregister_listener(self.poll.registry(), listener);
        }
    }

    /// A worker closed a connection; start accepting again if there is room.
    fn maybe_resume_accepting(&mut self) {
        if self.accepting || self.at_capacity() {
            return;
        }
        self.accepting = true;
        self.srv.shared.accept_paused.store(false, Ordering::SeqCst);
        for (i, listener) in self.listeners.iter_mut().enumerate() {
            if let Err(e) = register_listener(self.poll.registry(), listener, Token(i)) {
                error!(error = %e, "failed to re-register listener");
            }
        }
        for idx in 0..self.listeners.len() {
            self.accept_loop(idx);
        }
    }
}

fn register_listener(
    registry: &mio::Registry,
    listener: &mut ListenerSocket,
    token: Token,
) -> io::Result<()> {
    match listener {
        ListenerSocket::Tcp(l) => registry.register(l, token, Interest::READABLE),
        ListenerSocket::Unix(l) => registry.register(l, token, Interest::READABLE),
    }
}

fn deregister_listener(registry: &mio::Registry, listener: &mut ListenerSocket) {
    let _ = match listener {
        ListenerSocket::Tcp(l) => registry.deregister(l),
        ListenerSocket::Unix(l) => registry.deregister(l),
    };
}

/// Waker-driven cross-thread state shared between the dispatcher and its
/// workers.
pub struct SharedState {
    pub dispatcher_waker: Waker,
    pub accept_paused: AtomicBool,
    pub curr_conns: std::sync::atomic::AtomicUsize,
}

impl SharedState {
    pub fn conn_closed(&self) {
        self.curr_conns.fetch_sub(1, Ordering::SeqCst);
        if self.accept_paused.load(Ordering::SeqCst) {
            let _ = self.dispatcher_waker.wake();
        }
    }
}
