//! Readiness-driven runtime shared by the broker and the endpoint.
//!
//! Both roles are built from the same pieces:
//! - `ByteStream`: growable buffer with partial-I/O semantics
//! - `Peer` / `PeerRegistry`: connection state and the peer table
//! - `PeerId`: generation-checked multiplexer tokens
//!
//! Everything runs on the caller's thread. The only blocking point is the
//! readiness wait inside `update`, bounded by the caller's timeout.

mod buffer;
mod connection;
mod token;

pub use buffer::{ByteStream, ReceiveStatus, SendStatus, MIN_CAPACITY};
pub use connection::{interest_for, ConnState, Peer, PeerRegistry};
pub use token::{PeerId, ENDPOINT_TOKEN, LISTENER_TOKEN};

use crate::error::{ChatError, Result};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

/// Pending-connection backlog for the listening socket.
const LISTEN_BACKLOG: i32 = 128;

/// Outcome of one readiness cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// At least one readiness event was serviced.
    Processed,
    /// The wait expired with nothing ready.
    TimedOut,
}

/// Create a non-blocking listener on all IPv4 interfaces.
///
/// `SO_REUSEADDR` is set so a restarted broker can rebind while old
/// connections linger in TIME_WAIT. Address-in-use maps to
/// [`ChatError::PortBusy`].
pub(crate) fn create_listener(port: u16) -> Result<std::net::TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into()).map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => ChatError::PortBusy(port),
        _ => ChatError::System(e),
    })?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
