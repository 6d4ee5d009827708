// This file is part of qnet-arbiter.

//! Listener and accept path (component C8).

use mio::tcp::TcpListener;
use net2::TcpBuilder;
use std::io;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any,
    V4,
    V6,
}

/// Bind a non-blocking listening socket honoring the configured address family and backlog,
/// the way `net2::TcpBuilder` is used across the pack for backlog/reuseaddr control that
/// `std::net::TcpListener` doesn't expose directly.
pub fn bind(addr: Option<&str>, port: u16, family: AddressFamily, backlog: i32) -> io::Result<TcpListener> {
    let bind_addr = match (addr, family) {
        (Some(addr), _) => format!("{}:{}", addr, port),
        (None, AddressFamily::V6) => format!(":::{}", port),
        (None, _) => format!("0.0.0.0:{}", port),
    };
    let socket_addr: SocketAddr = bind_addr.parse().map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, format!("{}", err)))?;

    let builder = if socket_addr.is_ipv4() {
        TcpBuilder::new_v4()?
    } else {
        TcpBuilder::new_v6()?
    };
    builder.reuse_address(true)?;
    builder.bind(socket_addr)?;
    let listener = builder.listen(backlog)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// Outcome of one accept attempt, letting the caller decide whether the connection is
/// admitted before any session state is allocated.
pub enum AcceptOutcome {
    Accepted { stream: mio::tcp::TcpStream, peer_addr: String },
    WouldBlock,
    AdmissionDenied(mio::tcp::TcpStream),
    Io(io::Error),
}

/// Accept one pending connection, applying the admission cap before any session allocation
/// happens (spec's accept-path rule: over-cap connections are closed with no reply at all).
pub fn accept(listener: &TcpListener, active_clients: usize, max_clients: usize) -> AcceptOutcome {
    match listener.accept() {
        Ok((stream, addr)) => {
            if let Err(err) = stream.set_nodelay(true) {
                return AcceptOutcome::Io(err);
            }
            if max_clients > 0 && active_clients >= max_clients {
                return AcceptOutcome::AdmissionDenied(stream);
            }
            AcceptOutcome::Accepted {
                stream,
                peer_addr: addr.to_string(),
            }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => AcceptOutcome::WouldBlock,
        Err(err) => AcceptOutcome::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_any_port_picks_ephemeral_v4() {
        let listener = bind(None, 0, AddressFamily::V4, 16).expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr");
        assert!(addr.port() > 0);
    }
}
