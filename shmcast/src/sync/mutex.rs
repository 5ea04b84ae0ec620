use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
};

use libc::{
    pthread_mutex_consistent, pthread_mutex_destroy, pthread_mutex_init, pthread_mutex_lock,
    pthread_mutex_t, pthread_mutex_unlock, pthread_mutexattr_destroy, pthread_mutexattr_init,
    pthread_mutexattr_setpshared, pthread_mutexattr_setrobust, EOWNERDEAD, ENOTRECOVERABLE,
    PTHREAD_MUTEX_ROBUST, PTHREAD_PROCESS_SHARED,
};
use tracing::{error, warn};

use crate::{shm::ShmSafe, CheckOk, SyncError};

/// How many times a single `lock` call may rebuild an unrecoverable mutex.
const MAX_REINITS: usize = 4;

/// Process-shared, robust mutex meant to be opened in place inside a mapped region.
///
/// A lock attempt that finds the previous holder dead marks the mutex
/// consistent and retries. A mutex that can no longer be recovered is
/// destroyed and re-initialized in place.
#[repr(C)]
#[derive(Debug)]
pub struct Mutex<T> {
    lock: UnsafeCell<MaybeUninit<pthread_mutex_t>>,
    data: UnsafeCell<MaybeUninit<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Usable,
    OwnerDead,
    Unrecoverable,
}

impl<T> Mutex<T> {
    unsafe fn init_lock(lock: *mut pthread_mutex_t) -> Result<(), SyncError> {
        let mut attr = MaybeUninit::uninit();
        pthread_mutexattr_init(attr.as_mut_ptr()).r("pthread_mutexattr_init")?;

        let result = pthread_mutexattr_setpshared(attr.as_mut_ptr(), PTHREAD_PROCESS_SHARED)
            .r("pthread_mutexattr_setpshared")
            .and_then(|()| {
                pthread_mutexattr_setrobust(attr.as_mut_ptr(), PTHREAD_MUTEX_ROBUST)
                    .r("pthread_mutexattr_setrobust")
            })
            .and_then(|()| pthread_mutex_init(lock, attr.as_ptr()).r("pthread_mutex_init"));

        pthread_mutexattr_destroy(attr.as_mut_ptr());
        result
    }

    /// Initializes a mutex holding `value` at `target`.
    ///
    /// # Safety
    /// `target` must be valid for writes and must not hold a mutex that
    /// anyone is using.
    pub unsafe fn open(target: *mut Self, value: T) -> Result<(), SyncError> {
        let lock = &raw mut (*target).lock;
        let data = &raw mut (*target).data;
        Self::init_lock(lock.cast())?;
        data.cast::<T>().write(value);
        Ok(())
    }

    /// Destroys the mutex.
    ///
    /// # Safety
    /// Nobody may lock the mutex afterwards, in this or any other process.
    pub unsafe fn close(&self) -> Result<(), SyncError> {
        pthread_mutex_destroy(self.raw()).r("pthread_mutex_destroy")
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>, SyncError> {
        let mut state = LockState::Usable;
        let mut reinits = 0;
        loop {
            state = match state {
                LockState::Usable => match unsafe { pthread_mutex_lock(self.raw()) } {
                    0 => return Ok(MutexGuard { lock: self }),
                    EOWNERDEAD => LockState::OwnerDead,
                    ENOTRECOVERABLE => LockState::Unrecoverable,
                    code => return Err(SyncError::logged("pthread_mutex_lock", code)),
                },
                LockState::OwnerDead => {
                    warn!("previous holder died while holding the mutex, marking it consistent");
                    if unsafe { pthread_mutex_consistent(self.raw()) } == 0 {
                        unsafe { pthread_mutex_unlock(self.raw()) }.r("pthread_mutex_unlock")?;
                        LockState::Usable
                    } else {
                        LockState::Unrecoverable
                    }
                }
                LockState::Unrecoverable => {
                    reinits += 1;
                    if reinits > MAX_REINITS {
                        return Err(SyncError::logged("pthread_mutex_lock", ENOTRECOVERABLE));
                    }
                    warn!("mutex is not recoverable, re-initializing it in place");
                    unsafe {
                        pthread_mutex_destroy(self.raw()).r("pthread_mutex_destroy")?;
                        Self::init_lock(self.raw())?;
                    }
                    LockState::Usable
                }
            };
        }
    }

    fn raw(&self) -> *mut pthread_mutex_t {
        unsafe { (*self.lock.get()).as_mut_ptr() }
    }
}

pub struct MutexGuard<'a, T: 'a> {
    lock: &'a Mutex<T>,
}

impl<'a, T: 'a> MutexGuard<'a, T> {
    pub(crate) fn get_inner_lock(&self) -> *mut pthread_mutex_t {
        self.lock.raw()
    }

    /// Keeps holding a mutex whose previous owner died during a condvar wait.
    pub(crate) fn make_consistent(&mut self) -> Result<(), SyncError> {
        warn!("previous holder died while holding the mutex, marking it consistent");
        unsafe { pthread_mutex_consistent(self.lock.raw()) }.r("pthread_mutex_consistent")
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { (*self.lock.data.get()).assume_init_ref() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { (*self.lock.data.get()).assume_init_mut() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let code = unsafe { pthread_mutex_unlock(self.lock.raw()) };
        if code != 0 {
            error!(code, "failed to unlock mutex");
        }
    }
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

unsafe impl<T> ShmSafe for Mutex<T> where T: ShmSafe {}
