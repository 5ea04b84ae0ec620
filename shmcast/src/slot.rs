use std::mem::MaybeUninit;

use crate::{registry::ReaderId, shm::ShmSafe};

/// Every bit set: unread by any reader that may exist.
pub const ALL_READERS: u32 = u32::MAX;

/// One ring entry. A set bit in `unread` means that reader has not consumed
/// the payload yet. A slot that was never written has no bits set.
#[repr(C)]
#[derive(Debug)]
pub struct Slot<T> {
    payload: MaybeUninit<T>,
    unread: u32,
}

impl<T: Copy> Slot<T> {
    pub fn vacant() -> Self {
        Self {
            payload: MaybeUninit::uninit(),
            unread: 0,
        }
    }

    /// Overwrites the payload and marks it unread for everyone.
    pub fn store(&mut self, value: T) {
        self.payload.write(value);
        self.unread = ALL_READERS;
    }

    /// Copies the payload out if `reader` has not consumed it yet.
    pub fn take(&mut self, reader: ReaderId) -> Option<T> {
        if !self.is_unread_by(reader) {
            return None;
        }
        self.unread &= !reader.bit();
        // Bits are only ever set on a stored slot.
        Some(unsafe { self.payload.assume_init_read() })
    }
}

impl<T> Slot<T> {
    pub fn unread_mask(&self) -> u32 {
        self.unread
    }

    pub fn is_unread_by(&self, reader: ReaderId) -> bool {
        self.unread & reader.bit() != 0
    }

    pub fn forget(&mut self, reader: ReaderId) {
        self.unread &= !reader.bit();
    }

    /// Hands the current payload to `reader` again.
    ///
    /// # Safety
    /// The slot must have been written by [`Slot::store`] at least once.
    pub unsafe fn mark_unread(&mut self, reader: ReaderId) {
        self.unread |= reader.bit();
    }
}

unsafe impl<T: ShmSafe> ShmSafe for Slot<T> {}
