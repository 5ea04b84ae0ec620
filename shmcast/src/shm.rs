use std::{os::fd::OwnedFd, ptr::null_mut, ptr::NonNull};

use arrayvec::ArrayString;
use rustix::{
    fs::{fstat, ftruncate, Mode},
    io::Errno,
    mm::{mmap, munmap, MapFlags, ProtFlags},
    shm::{self, OFlags},
};
use tracing::error;

use crate::RegionError;

/// Marker for types that can live in memory shared with other processes.
///
/// # Safety
/// Implementors must not contain pointers, references or handles that are
/// only meaningful inside one address space, and every bit pattern written by
/// one process must be a valid value when read by another.
pub unsafe trait ShmSafe {}

macro_rules! impl_shm_safe {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl ShmSafe for $ty {})*
    };
}

impl_shm_safe!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char);

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}
unsafe impl<const N: usize> ShmSafe for ArrayString<N> {}

/// A mapped POSIX shared memory object.
///
/// The creating side owns the name and unlinks it on drop, unless the name
/// has since been taken over by a different object.
#[derive(Debug)]
pub struct Region {
    is_initiator: bool,
    name: String,
    inode: u64,
    memory: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Creates a new zero-filled object of `len` bytes. Fails if `name` exists.
    pub fn create(name: &str, len: usize) -> Result<Self, RegionError> {
        let name = shm_name(name)?;

        let fd = shm::open(
            name.as_str(),
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|errno| RegionError::os("shm_open", &name, errno))?;

        let mapped = ftruncate(&fd, len as u64)
            .map_err(|errno| RegionError::os("ftruncate", &name, errno))
            .and_then(|()| {
                let inode = fstat(&fd)
                    .map_err(|errno| RegionError::os("fstat", &name, errno))?
                    .st_ino as u64;
                let memory = unsafe { Self::mmap(&fd, len) }
                    .map_err(|errno| RegionError::os("mmap", &name, errno))?;
                Ok((inode, memory))
            });

        match mapped {
            Ok((inode, memory)) => Ok(Self {
                is_initiator: true,
                name,
                inode,
                memory,
                len,
            }),
            Err(err) => {
                let _ = shm::unlink(name.as_str());
                Err(err)
            }
        }
    }

    /// Maps an existing object in full. Objects shorter than `min_len` are
    /// rejected before mapping, which also covers a creator that has not
    /// sized the object yet.
    pub fn open(name: &str, min_len: usize) -> Result<Self, RegionError> {
        let name = shm_name(name)?;

        let fd = shm::open(name.as_str(), OFlags::RDWR, Mode::RUSR | Mode::WUSR)
            .map_err(|errno| RegionError::os("shm_open", &name, errno))?;

        let stat = fstat(&fd).map_err(|errno| RegionError::os("fstat", &name, errno))?;
        let len = usize::try_from(stat.st_size).unwrap_or(0);
        if len == 0 || len < min_len {
            return Err(RegionError::TooSmall {
                name,
                len,
                min: min_len,
            });
        }

        let memory =
            unsafe { Self::mmap(&fd, len) }.map_err(|errno| RegionError::os("mmap", &name, errno))?;

        Ok(Self {
            is_initiator: false,
            name,
            inode: stat.st_ino as u64,
            memory,
            len,
        })
    }

    pub fn unlink(name: &str) -> Result<(), RegionError> {
        let name = shm_name(name)?;
        shm::unlink(name.as_str()).map_err(|errno| RegionError::os("shm_unlink", &name, errno))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    unsafe fn mmap(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>, Errno> {
        // Safety: Ptr is null
        let ptr = mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?;
        NonNull::new(ptr.cast()).ok_or(Errno::FAULT)
    }

    /// Whether `name` still refers to the object this region mapped.
    fn still_linked(&self) -> bool {
        let Ok(fd) = shm::open(self.name.as_str(), OFlags::RDONLY, Mode::empty()) else {
            return false;
        };
        fstat(&fd).is_ok_and(|stat| stat.st_ino as u64 == self.inode)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(errno) = unsafe { munmap(self.memory.as_ptr().cast(), self.len) } {
            error!(name = %self.name, len = self.len, %errno, "munmap failed");
        }
        if self.is_initiator && self.still_linked() {
            if let Err(errno) = shm::unlink(self.name.as_str()) {
                error!(name = %self.name, %errno, "shm_unlink failed");
            }
        }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn shm_name(name: &str) -> Result<String, RegionError> {
    match name {
        "" | "/" => Err(RegionError::EmptyName),
        name if name.starts_with('/') => Ok(name.to_owned()),
        name => Ok(format!("/{name}")),
    }
}
