//! Socket utilities and tuning

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;

/// Create a listening TCP socket for the HTTP/WebSocket server.
///
/// Returned in non-blocking mode, ready for `tokio::net::TcpListener::from_std`.
pub fn create_tcp_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Allow quick restarts while old sockets sit in TIME_WAIT
    socket.set_reuse_address(true)?;

    // Accepted sockets inherit these on Linux
    socket.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    socket.set_tcp_keepalive(&keepalive)?;

    socket.set_nonblocking(true)?;

    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
