//! Connection identifiers.

/// Opaque connection identifier.
///
/// Encodes a slab slot and a generation counter, so an id held by a worker
/// after its connection closed never matches a new connection that reuses
/// the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    #[inline]
    pub(crate) fn with_generation(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    /// Slot index in the reactor's connection slab.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}
