//! Multiplexer tokens for peer connections.
//!
//! A token packs the peer's slab slot with a small generation counter. The
//! slab reuses a slot as soon as a peer is removed, so a readiness event
//! fetched before the removal could otherwise reach the new occupant. The
//! generation lets the registry reject such stale events.

use mio::Token;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token used by an endpoint for its single socket.
pub const ENDPOINT_TOKEN: Token = Token(0);

const GENERATION_BITS: u32 = 8;
const GENERATION_MASK: usize = (1 << GENERATION_BITS) - 1;

/// Largest slot index that can be packed into a token.
pub const MAX_SLOT: usize = (usize::MAX >> GENERATION_BITS) - 1;

/// Stable handle for one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    slot: usize,
    generation: u8,
}

impl PeerId {
    pub fn new(slot: usize, generation: u8) -> Self {
        debug_assert!(slot <= MAX_SLOT, "slot out of token range");
        Self { slot, generation }
    }

    pub fn slot(self) -> usize {
        self.slot
    }

    pub fn generation(self) -> u8 {
        self.generation
    }

    pub fn token(self) -> Token {
        Token((self.slot << GENERATION_BITS) | self.generation as usize)
    }

    /// Decode a peer token. The listener token never decodes.
    pub fn from_token(token: Token) -> Option<Self> {
        if token == LISTENER_TOKEN {
            return None;
        }
        Some(Self {
            slot: token.0 >> GENERATION_BITS,
            generation: (token.0 & GENERATION_MASK) as u8,
        })
    }
}

/// Wrapping generation source.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    next: u8,
}

impl GenerationCounter {
    pub fn next_generation(&mut self) -> u8 {
        let generation = self.next;
        self.next = self.next.wrapping_add(1);
        generation
    }
}
