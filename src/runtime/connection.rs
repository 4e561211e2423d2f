//! Connection state machine, broker-side peers and the peer table.
//!
//! Each peer owns its socket, an inbound and an outbound stream, the display
//! name learned from its handshake, and the interest currently armed in the
//! multiplexer.

use crate::error::Result;
use crate::runtime::token::{GenerationCounter, PeerId, MAX_SLOT};
use crate::runtime::ByteStream;
use mio::net::TcpStream;
use mio::{Interest, Registry};
use slab::Slab;
use std::net::SocketAddr;

/// Lifecycle shared by peers and endpoints. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    Connected,
    Closed,
}

/// Interest implied by an outbound stream: always readable, writable only
/// while bytes are waiting to be flushed.
pub fn interest_for(outbound: &ByteStream) -> Interest {
    if outbound.has_pending() {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// One accepted connection.
#[derive(Debug)]
pub struct Peer {
    pub socket: TcpStream,
    pub addr: SocketAddr,
    /// Set by the first decoded frame.
    pub name: Option<String>,
    pub inbound: ByteStream,
    pub outbound: ByteStream,
    /// Interest last pushed to the multiplexer.
    armed: Interest,
}

impl Peer {
    /// Create a peer for a freshly accepted socket. Nothing is registered yet.
    pub fn new(socket: TcpStream, addr: SocketAddr) -> Self {
        Self {
            socket,
            addr,
            name: None,
            inbound: ByteStream::new(),
            outbound: ByteStream::new(),
            armed: Interest::READABLE,
        }
    }

    pub fn interest(&self) -> Interest {
        interest_for(&self.outbound)
    }

    #[cfg(test)]
    pub(crate) fn armed(&self) -> Interest {
        self.armed
    }

    pub fn register(&mut self, registry: &Registry, id: PeerId) -> Result<()> {
        self.armed = self.interest();
        registry.register(&mut self.socket, id.token(), self.armed)?;
        Ok(())
    }

    /// Push the current interest to the multiplexer if it changed.
    ///
    /// Edge-triggered backends only report writability again while it is
    /// armed, so this must run after every change to the outbound stream.
    pub fn sync_interest(&mut self, registry: &Registry, id: PeerId) -> Result<()> {
        let wanted = self.interest();
        if wanted != self.armed {
            registry.reregister(&mut self.socket, id.token(), wanted)?;
            self.armed = wanted;
        }
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) -> Result<()> {
        registry.deregister(&mut self.socket)?;
        Ok(())
    }

    /// Name for log lines.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

/// Table of live peers keyed by generation-checked ids.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Slab<(u8, Peer)>,
    generations: GenerationCounter,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: Slab::new(),
            generations: GenerationCounter::default(),
            max_peers: max_peers.min(MAX_SLOT),
        }
    }

    /// Insert a peer. Returns the peer back if the table is full.
    pub fn insert(&mut self, peer: Peer) -> std::result::Result<PeerId, Peer> {
        if self.peers.len() >= self.max_peers {
            return Err(peer);
        }
        let generation = self.generations.next_generation();
        let slot = self.peers.insert((generation, peer));
        Ok(PeerId::new(slot, generation))
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        match self.peers.get(id.slot()) {
            Some((generation, peer)) if *generation == id.generation() => Some(peer),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        match self.peers.get_mut(id.slot()) {
            Some((generation, peer)) if *generation == id.generation() => Some(peer),
            _ => None,
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        if self.contains(id) {
            Some(self.peers.remove(id.slot()).1)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_peers
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Peer)> {
        self.peers
            .iter()
            .map(|(slot, (generation, peer))| (PeerId::new(slot, *generation), peer))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PeerId, &mut Peer)> {
        self.peers
            .iter_mut()
            .map(|(slot, (generation, peer))| (PeerId::new(slot, *generation), peer))
    }
}
