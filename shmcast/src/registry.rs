use thiserror::Error;

use crate::shm::ShmSafe;

/// A reader identity: exactly one bit of the connection mask.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u32);

impl ReaderId {
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .map(Self)
    }

    pub fn bit(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0.trailing_zeros() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all reader identities are taken")]
pub struct RegistryFull;

/// Bitmask of connected readers. Lives in the shared header and is only
/// touched with the header mutex held.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRegistry {
    mask: u32,
}

impl ConnectionRegistry {
    /// Hands out the lowest free identity.
    pub fn connect(&mut self) -> Result<ReaderId, RegistryFull> {
        if self.mask == u32::MAX {
            return Err(RegistryFull);
        }
        let next = self.mask | (self.mask + 1);
        let id = ReaderId(next ^ self.mask);
        self.mask = next;
        Ok(id)
    }

    pub fn disconnect(&mut self, id: ReaderId) {
        self.mask &= !id.bit();
    }

    pub fn is_connected(&self, id: ReaderId) -> bool {
        self.mask & id.bit() != 0
    }

    pub fn count(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }
}

unsafe impl ShmSafe for ConnectionRegistry {}
