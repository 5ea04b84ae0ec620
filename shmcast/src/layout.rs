use std::{
    any::type_name,
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    registry::ConnectionRegistry,
    shm::{Region, ShmSafe},
    slot::Slot,
    sync::{Condvar, Deadline, Mutex, MutexGuard, WaitStatus},
    AttachError, RegionError, SyncError,
};

/// Written last during initialization. Readers ignore regions without it.
pub const MAGIC_VALUE: u32 = 0x5348_4D43;

/// Mutable channel state, guarded by the header mutex.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ChannelState {
    pub shutdown: bool,
    /// Index of the slot written last.
    pub write_index: usize,
    /// Number of values published since creation.
    pub published: u64,
    pub registry: ConnectionRegistry,
}

unsafe impl ShmSafe for ChannelState {}

/// Fixed prefix of every region. The slot array follows at
/// [`RegionLayout::slots_offset`].
#[repr(C, align(64))]
#[derive(Debug)]
pub struct Header {
    magic: AtomicU32,
    owner_pid: u32,
    capacity: usize,
    type_tag: u64,
    slot_size: usize,
    slot_align: usize,
    region_len: usize,
    cond: Condvar,
    state: Mutex<ChannelState>,
}

impl Header {
    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC_VALUE
    }

    /// Stops new subscribers from attaching.
    pub(crate) fn retire(&self) {
        self.magic.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn type_tag(&self) -> u64 {
        self.type_tag
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn state(&self) -> &Mutex<ChannelState> {
        &self.state
    }

    pub fn cond(&self) -> &Condvar {
        &self.cond
    }

    /// Verifies the region was created for `T` and is as large as the header claims.
    pub fn check<T: ShmSafe + Copy>(&self, mapped_len: usize) -> Result<RegionLayout, AttachError> {
        let expected = type_tag::<T>();
        if self.type_tag != expected {
            return Err(AttachError::TypeMismatch {
                expected,
                found: self.type_tag,
            });
        }

        let Some(layout) = RegionLayout::for_capacity::<T>(self.capacity) else {
            return Err(AttachError::LayoutMismatch {
                expected: 0,
                found: self.region_len,
            });
        };
        if self.slot_size != size_of::<Slot<T>>()
            || self.slot_align != align_of::<Slot<T>>()
            || self.region_len != layout.len
        {
            return Err(AttachError::LayoutMismatch {
                expected: layout.len,
                found: self.region_len,
            });
        }
        if mapped_len < layout.len {
            return Err(AttachError::LayoutMismatch {
                expected: layout.len,
                found: mapped_len,
            });
        }
        Ok(layout)
    }
}

unsafe impl ShmSafe for Header {}

/// Byte layout of a region holding `capacity` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub slots_offset: usize,
    pub len: usize,
}

impl RegionLayout {
    /// `None` for zero capacity or sizes that overflow.
    pub fn for_capacity<T: ShmSafe + Copy>(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let slots_offset = size_of::<Header>().checked_next_multiple_of(align_of::<Slot<T>>())?;
        let len = size_of::<Slot<T>>()
            .checked_mul(capacity)?
            .checked_add(slots_offset)?;
        if len > isize::MAX as usize {
            return None;
        }
        Some(Self { slots_offset, len })
    }
}

/// Stable identity of a payload type: FNV-1a over its name, size and alignment.
pub fn type_tag<T>() -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let size = (size_of::<T>() as u64).to_le_bytes();
    let align = (align_of::<T>() as u64).to_le_bytes();
    type_name::<T>()
        .bytes()
        .chain(size)
        .chain(align)
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

/// A mapped region viewed as a header plus a typed slot ring.
#[derive(Debug)]
pub(crate) struct Mapping<T> {
    region: Region,
    slots: NonNull<Slot<T>>,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe + Copy> Mapping<T> {
    /// Writes a fresh header and vacant slots, then publishes the magic value.
    ///
    /// # Safety
    /// `region` must be newly created, at least `layout.len` bytes long and
    /// not yet visible as ready to anyone else.
    pub unsafe fn initialize(
        region: Region,
        capacity: usize,
        layout: RegionLayout,
    ) -> Result<Self, SyncError> {
        let header = region.as_ptr().cast::<Header>();

        (&raw mut (*header).owner_pid).write(std::process::id());
        (&raw mut (*header).capacity).write(capacity);
        (&raw mut (*header).type_tag).write(type_tag::<T>());
        (&raw mut (*header).slot_size).write(size_of::<Slot<T>>());
        (&raw mut (*header).slot_align).write(align_of::<Slot<T>>());
        (&raw mut (*header).region_len).write(layout.len);

        Condvar::open(&raw mut (*header).cond)?;
        Mutex::open(&raw mut (*header).state, ChannelState::default())?;

        let slots = region.as_ptr().add(layout.slots_offset).cast::<Slot<T>>();
        for index in 0..capacity {
            slots.add(index).write(Slot::vacant());
        }

        (*header).magic.store(MAGIC_VALUE, Ordering::Release);

        Ok(Self {
            region,
            slots: NonNull::new_unchecked(slots),
            capacity,
            _marker: PhantomData,
        })
    }

    /// Maps an initialized region created for `T`.
    ///
    /// Regions that do not exist, are not initialized yet or were shut down
    /// are all reported as [`AttachError::Missing`].
    pub fn open(name: &str) -> Result<Self, AttachError> {
        let region = match Region::open(name, size_of::<Header>()) {
            Ok(region) => region,
            Err(err) if err.is_not_found() => return Err(missing(name)),
            Err(RegionError::TooSmall { .. }) => return Err(missing(name)),
            Err(err) => return Err(err.into()),
        };

        let header = unsafe { &*region.as_ptr().cast::<Header>() };
        if !header.is_ready() {
            return Err(missing(name));
        }
        let layout = header.check::<T>(region.len())?;
        if header.state().lock()?.shutdown {
            return Err(missing(name));
        }

        let capacity = header.capacity();
        let slots = unsafe { region.as_ptr().add(layout.slots_offset).cast::<Slot<T>>() };
        Ok(Self {
            region,
            slots: unsafe { NonNull::new_unchecked(slots) },
            capacity,
            _marker: PhantomData,
        })
    }
}

impl<T> Mapping<T> {
    pub fn header(&self) -> &Header {
        unsafe { &*self.region.as_ptr().cast::<Header>() }
    }

    pub fn lock(&self) -> Result<Locked<'_, T>, SyncError> {
        let header = self.header();
        Ok(Locked {
            guard: header.state().lock()?,
            cond: header.cond(),
            slots: self.slots,
            capacity: self.capacity,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

unsafe impl<T: Send> Send for Mapping<T> {}
unsafe impl<T: Send> Sync for Mapping<T> {}

fn missing(name: &str) -> AttachError {
    AttachError::Missing {
        name: name.to_owned(),
    }
}

/// Channel state and slots with the header mutex held.
pub(crate) struct Locked<'a, T> {
    guard: MutexGuard<'a, ChannelState>,
    cond: &'a Condvar,
    slots: NonNull<Slot<T>>,
    capacity: usize,
}

impl<T> Locked<'_, T> {
    pub fn slot_mut(&mut self, index: usize) -> &mut Slot<T> {
        debug_assert!(index < self.capacity, "slot {index} out of {}", self.capacity);
        unsafe { &mut *self.slots.as_ptr().add(index) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn wait(&mut self, deadline: Deadline) -> Result<WaitStatus, SyncError> {
        self.cond.wait(&mut self.guard, deadline)
    }

    pub fn broadcast(&self) -> Result<(), SyncError> {
        self.cond.broadcast()
    }
}

impl<T> Deref for Locked<'_, T> {
    type Target = ChannelState;
    fn deref(&self) -> &ChannelState {
        &self.guard
    }
}

impl<T> DerefMut for Locked<'_, T> {
    fn deref_mut(&mut self) -> &mut ChannelState {
        &mut self.guard
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ImuSample;

    #[test]
    fn type_tags_are_stable_and_distinct() {
        assert_eq!(type_tag::<u64>(), type_tag::<u64>());
        assert_ne!(type_tag::<u64>(), type_tag::<i64>());
        assert_ne!(type_tag::<u32>(), type_tag::<[u8; 4]>());
        assert_ne!(type_tag::<ImuSample>(), type_tag::<u64>());
    }

    #[test]
    fn slots_follow_the_aligned_header() {
        assert_eq!(align_of::<Header>(), 64);
        assert_eq!(size_of::<Header>() % 64, 0);

        let layout = RegionLayout::for_capacity::<ImuSample>(10).unwrap();
        assert_eq!(layout.slots_offset % align_of::<Slot<ImuSample>>(), 0);
        assert!(layout.slots_offset >= size_of::<Header>());
        assert_eq!(
            layout.len,
            layout.slots_offset + 10 * size_of::<Slot<ImuSample>>()
        );
    }

    #[test]
    fn rejects_degenerate_capacities() {
        assert_eq!(RegionLayout::for_capacity::<u64>(0), None);
        assert_eq!(RegionLayout::for_capacity::<u64>(usize::MAX), None);
        assert_eq!(RegionLayout::for_capacity::<u64>(usize::MAX / 4), None);
    }
}
