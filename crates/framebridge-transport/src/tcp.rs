use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// `127.0.0.1:port`.
pub fn loopback_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Connect to a loopback peer with a bounded connect timeout.
pub fn connect_loopback(port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = loopback_addr(port);
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|source| TransportError::Connect { addr, source })?;
    stream.set_nodelay(true)?;
    debug!(%addr, "connected to loopback peer");
    Ok(stream)
}

/// Bind a loopback listener. Port 0 picks an ephemeral port.
pub fn bind_loopback(port: u16) -> Result<TcpListener> {
    let addr = loopback_addr(port);
    let listener =
        TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
    info!(addr = %listener.local_addr()?, "listening on loopback");
    Ok(listener)
}

/// Whether a loopback listener could currently bind `port`.
pub fn port_available(port: u16) -> bool {
    TcpListener::bind(loopback_addr(port)).is_ok()
}
