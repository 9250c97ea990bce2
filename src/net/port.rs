//! Loopback port discovery and readiness probing.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

/// Ask the OS for a currently free TCP port on the loopback interface.
///
/// The probe socket is bound with `SO_REUSEADDR` and closed before
/// returning, so the port is immediately bindable by a child process. The
/// OS may of course hand the port to someone else in between; callers that
/// launch a service on it should treat a failed bind as a retryable event.
pub fn find_available_port() -> std::io::Result<u16> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let request: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
    socket.bind(&request.into())?;
    let assigned = socket.local_addr()?;
    assigned
        .as_socket()
        .map(|addr| addr.port())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "bound socket has no inet address")
        })
}

/// Try to open a TCP connection to `127.0.0.1:port` within `timeout`.
/// The connection is closed immediately; only reachability is reported.
pub async fn probe_port(port: u16, timeout: Duration) -> std::io::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no answer on port {} within {:?}", port, timeout),
        )),
    }
}
