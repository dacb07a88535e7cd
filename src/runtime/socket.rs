//! Listening-socket construction and per-socket tuning.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Listen backlog.
pub const LISTEN_DEPTH: i32 = 4096;

/// Ceiling for the kernel-buffer probe.
const MAX_SOCKET_BUFFER: usize = 16 * 1024 * 1024;

fn domain_for(addr: SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

pub fn tcp_listener(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_DEPTH)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

pub fn udp_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(domain_for(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    maximize_buffer(&socket, true);
    maximize_buffer(&socket, false);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Binary-search the largest send or receive buffer the kernel will grant.
/// Outbound buffers are maximized once here so writes pause less often.
fn maximize_buffer(socket: &Socket, send: bool) {
    let current = if send {
        socket.send_buffer_size()
    } else {
        socket.recv_buffer_size()
    };
    let mut lo = current.unwrap_or(64 * 1024);
    let mut hi = MAX_SOCKET_BUFFER;

    while lo + 1 < hi {
        let probe = lo + (hi - lo) / 2;
        let granted = if send {
            socket
                .set_send_buffer_size(probe)
                .and_then(|_| socket.send_buffer_size())
        } else {
            socket
                .set_recv_buffer_size(probe)
                .and_then(|_| socket.recv_buffer_size())
        };
        match granted {
            Ok(actual) if actual >= probe => lo = probe,
            _ => hi = probe,
        }
    }
}

pub fn unix_listener(path: &Path) -> io::Result<mio::net::UnixListener> {
    use std::os::unix::fs::FileTypeExt;
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.file_type().is_socket() {
            std::fs::remove_file(path)?;
        }
    }
    mio::net::UnixListener::bind(path)
}

/// Accepted stream tuning: no Nagle delay, keepalive probes, and no linger
/// on close.
pub fn tune_stream(stream: &mio::net::TcpStream) {
    let fd = stream.as_raw_fd();
    set_opt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, true);
    set_opt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, true);

    let linger = libc::linger {
        l_onoff: 0,
        l_linger: 0,
    };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}

fn set_opt_bool(fd: libc::c_int, level: libc::c_int, opt: libc::c_int, on: bool) {
    let value: libc::c_int = on as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_socket_gets_large_buffers() {
        let sock = udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let probe = Socket::from(sock);
        // Linux doubles the requested size; just check it grew well past the
        // 64k floor we started from
        assert!(probe.recv_buffer_size().unwrap() >= 64 * 1024);
    }

    #[test]
    fn tcp_listener_binds_and_listens() {
        let listener = tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }
}
