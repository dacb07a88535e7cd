//! Event-driven runtime: one dispatcher thread accepting connections, N
//! worker threads each running a private reactor.

pub mod buffer;
pub mod connection;
pub mod dispatcher;
pub mod event_loop;
pub mod reply;
pub mod socket;

use crate::clock;
use crate::config::Settings;
use crate::protocol::BucketTable;
use crate::runtime::buffer::PoolRegistry;
use crate::runtime::dispatcher::{Dispatcher, ListenerSocket, SharedState, WorkerChannel};
use crate::runtime::event_loop::Worker;
use crate::stats::StatsSet;
use crate::storage::Store;
use mio::{Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Token reserved for cross-thread wake-ups on every poll instance.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// An accepted stream on its way from the dispatcher to a worker.
pub enum Handoff {
    Tcp(mio::net::TcpStream, SocketAddr),
    Unix(mio::net::UnixStream),
}

/// Shared handles every thread works against.
#[derive(Clone)]
pub struct ServerCtx {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub stats: Arc<StatsSet>,
    pub pools: Arc<PoolRegistry>,
    pub buckets: Arc<BucketTable>,
    pub shared: Arc<SharedState>,
}

/// Bring up listeners and worker threads, then run the dispatcher until
/// `shutdown` is raised. Blocks the calling thread.
pub fn run(
    settings: Arc<Settings>,
    store: Arc<Store>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    clock::init();

    /* a dead peer surfaces as EPIPE on write instead of killing the
     * process */
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let num_workers = settings.num_workers.max(1);
    let stats = StatsSet::new(num_workers + 1);
    let pools = PoolRegistry::new(num_workers);
    let buckets = Arc::new(BucketTable::new());

    let mut listeners = Vec::new();
    let mut udp = None;
    match &settings.socketpath {
        Some(path) => {
            listeners.push(ListenerSocket::Unix(socket::unix_listener(path)?));
            info!(path = %path.display(), "listening on unix socket");
        }
        None => {
            if settings.port > 0 {
                let addr = SocketAddr::new(settings.interface, settings.port);
                listeners.push(ListenerSocket::Tcp(socket::tcp_listener(addr)?));
                info!(%addr, "listening on tcp");
            }
            if settings.udpport > 0 {
                let addr = SocketAddr::new(settings.interface, settings.udpport);
                udp = Some(socket::udp_socket(addr)?);
                info!(%addr, "listening on udp");
            }
        }
    }

    let poll = Poll::new()?;
    let dispatcher_waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    let shared = Arc::new(SharedState {
        dispatcher_waker,
        accept_paused: AtomicBool::new(false),
        curr_conns: AtomicUsize::new(0),
    });

    let srv = ServerCtx {
        settings: Arc::clone(&settings),
        store,
        stats,
        pools,
        buckets,
        shared,
    };

    let mut channels = Vec::with_capacity(num_workers);
    let mut handles = Vec::with_capacity(num_workers);
    for id in 0..num_workers {
        let worker_poll = Poll::new()?;
        let waker = Arc::new(Waker::new(worker_poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = mpsc::channel();

        let udp_pair = match &udp {
            Some(sock) => {
                /* every worker watches a dup of the receive socket and sends
                 * replies on its own dup */
                let rx_sock = sock.try_clone()?;
                let tx_sock = socket2::Socket::from(sock.try_clone()?);
                Some((mio::net::UdpSocket::from_std(rx_sock), tx_sock))
            }
            None => None,
        };

        let worker = Worker::new(
            id,
            worker_poll,
            rx,
            srv.clone(),
            Arc::clone(&shutdown),
            udp_pair,
        )?;
        channels.push(WorkerChannel { tx, waker });
        handles.push(
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker.run())?,
        );
    }

    info!(
        workers = num_workers,
        maxconns = settings.maxconns,
        maxbytes = settings.maxbytes,
        "server started"
    );

    let mut dispatcher = Dispatcher::new(poll, listeners, channels, srv, shutdown)?;
    let result = dispatcher.run();

    for handle in handles {
        let _ = handle.join();
    }
    result
}
