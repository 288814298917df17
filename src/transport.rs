//! TCP plumbing: address resolution, dialing and binding with socket options.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::Config;
use crate::error::{Result, SeqlinkError};

/// Pending connection backlog for listeners.
const LISTEN_BACKLOG: u32 = 1024;

/// Resolve `addr` (`host:port`) to its first socket address.
pub(crate) async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        SeqlinkError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{addr} did not resolve to any address"),
        ))
    })
}

fn socket_for(addr: SocketAddr, config: &Config) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // keepalive period stays at the OS default; TcpSocket has no setter for it
    socket.set_keepalive(true)?;
    socket.set_recv_buffer_size(clamp_u32(config.read_buffer_size))?;
    socket.set_send_buffer_size(clamp_u32(config.write_buffer_size))?;
    Ok(socket)
}

fn clamp_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Connect to `addr` within `config.dial_timeout`.
pub(crate) async fn dial(addr: SocketAddr, config: &Config) -> Result<TcpStream> {
    let socket = socket_for(addr, config)?;

    let stream = tokio::time::timeout(config.dial_timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out after {:?}", config.dial_timeout),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Bind a listener on `addr`. Accepted sockets inherit keepalive and buffer
/// sizes from the listening socket.
pub(crate) fn bind(addr: SocketAddr, config: &Config) -> Result<TcpListener> {
    let socket = socket_for(addr, config)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}
