//! TCP socket setup shared by the rendezvous service and mesh nodes.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

const LISTEN_BACKLOG: i32 = 128;

/// Bind a non-blocking TCP listener with SO_REUSEADDR set.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind({addr})"))?;
    socket.listen(LISTEN_BACKLOG).context("listen()")?;

    TcpListener::from_std(socket.into()).context("failed to convert to tokio TcpListener")
}

/// Dial `host:port`, giving up after `timeout`.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("connect to {host}:{port} timed out"))?
        .with_context(|| format!("connect to {host}:{port}"))?;
    tune(&stream);
    Ok(stream)
}

/// Small control frames must not sit behind Nagle.
pub fn tune(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "TCP_NODELAY");
    }
}
