use std::{cell::UnsafeCell, mem::MaybeUninit, time::Duration};

use libc::{
    clock_gettime, pthread_cond_broadcast, pthread_cond_destroy, pthread_cond_init,
    pthread_cond_signal, pthread_cond_t, pthread_cond_timedwait, pthread_cond_wait,
    pthread_condattr_destroy, pthread_condattr_init, pthread_condattr_setclock,
    pthread_condattr_setpshared, timespec, CLOCK_MONOTONIC, EOWNERDEAD, ETIMEDOUT,
    PTHREAD_PROCESS_SHARED,
};

use crate::{shm::ShmSafe, CheckOk, SyncError};

use super::MutexGuard;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Process-shared condition variable timed against the monotonic clock.
#[repr(C)]
#[derive(Debug)]
pub struct Condvar {
    inner: UnsafeCell<MaybeUninit<pthread_cond_t>>,
}

/// When a wait gives up.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Do not block at all.
    Immediate,
    /// Absolute `CLOCK_MONOTONIC` time.
    At(timespec),
    Never,
}

impl Deadline {
    /// `None` waits forever and a zero timeout never blocks. A deadline too far
    /// out to represent is treated as no deadline.
    pub fn after(timeout: Option<Duration>) -> Result<Self, SyncError> {
        let Some(timeout) = timeout else {
            return Ok(Self::Never);
        };
        if timeout.is_zero() {
            return Ok(Self::Immediate);
        }

        let now = monotonic_now()?;
        let Ok(secs) = i64::try_from(timeout.as_secs()) else {
            return Ok(Self::Never);
        };
        let mut nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
        let mut carry = 0;
        if nanos >= NANOS_PER_SEC {
            nanos -= NANOS_PER_SEC;
            carry = 1;
        }
        let Some(tv_sec) = (now.tv_sec as i64)
            .checked_add(secs)
            .and_then(|s| s.checked_add(carry))
            .and_then(|s| libc::time_t::try_from(s).ok())
        else {
            return Ok(Self::Never);
        };

        Ok(Self::At(timespec {
            tv_sec,
            tv_nsec: nanos as _,
        }))
    }

    /// Whether the deadline lies in the past.
    pub fn has_passed(&self) -> Result<bool, SyncError> {
        match self {
            Self::Immediate => Ok(true),
            Self::Never => Ok(false),
            Self::At(at) => {
                let now = monotonic_now()?;
                Ok((now.tv_sec, now.tv_nsec) >= (at.tv_sec, at.tv_nsec))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken up, possibly spuriously.
    Notified,
    TimedOut,
}

impl Condvar {
    /// Initializes a condition variable at `target`.
    ///
    /// # Safety
    /// `target` must be valid for writes and must not hold a condvar anyone
    /// is waiting on.
    pub unsafe fn open(target: *mut Self) -> Result<(), SyncError> {
        let cond: *mut pthread_cond_t = (&raw mut (*target).inner).cast();

        let mut attr = MaybeUninit::uninit();
        pthread_condattr_init(attr.as_mut_ptr()).r("pthread_condattr_init")?;

        let result = pthread_condattr_setpshared(attr.as_mut_ptr(), PTHREAD_PROCESS_SHARED)
            .r("pthread_condattr_setpshared")
            .and_then(|()| {
                pthread_condattr_setclock(attr.as_mut_ptr(), CLOCK_MONOTONIC)
                    .r("pthread_condattr_setclock")
            })
            .and_then(|()| pthread_cond_init(cond, attr.as_ptr()).r("pthread_cond_init"));

        pthread_condattr_destroy(attr.as_mut_ptr());
        result
    }

    /// Destroys the condition variable.
    ///
    /// # Safety
    /// Nobody may wait on or signal it afterwards.
    pub unsafe fn close(&self) -> Result<(), SyncError> {
        pthread_cond_destroy(self.raw()).r("pthread_cond_destroy")
    }

    pub fn signal(&self) -> Result<(), SyncError> {
        unsafe { pthread_cond_signal(self.raw()) }.r("pthread_cond_signal")
    }

    pub fn broadcast(&self) -> Result<(), SyncError> {
        unsafe { pthread_cond_broadcast(self.raw()) }.r("pthread_cond_broadcast")
    }

    /// Releases the guarded mutex, waits and locks it again.
    ///
    /// Wake-ups may be spurious, so callers re-check their condition.
    pub fn wait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Deadline,
    ) -> Result<WaitStatus, SyncError> {
        let code = match deadline {
            Deadline::Immediate => return Ok(WaitStatus::TimedOut),
            Deadline::Never => unsafe { pthread_cond_wait(self.raw(), guard.get_inner_lock()) },
            Deadline::At(at) => unsafe {
                pthread_cond_timedwait(self.raw(), guard.get_inner_lock(), &raw const at)
            },
        };

        match code {
            0 => Ok(WaitStatus::Notified),
            ETIMEDOUT => Ok(WaitStatus::TimedOut),
            EOWNERDEAD => {
                guard.make_consistent()?;
                Ok(WaitStatus::Notified)
            }
            code => Err(SyncError::logged("pthread_cond_wait", code)),
        }
    }

    fn raw(&self) -> *mut pthread_cond_t {
        unsafe { (*self.inner.get()).as_mut_ptr() }
    }
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

unsafe impl ShmSafe for Condvar {}

fn monotonic_now() -> Result<timespec, SyncError> {
    let mut now = MaybeUninit::<timespec>::uninit();
    if unsafe { clock_gettime(CLOCK_MONOTONIC, now.as_mut_ptr()) } != 0 {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(SyncError::logged("clock_gettime", code));
    }
    Ok(unsafe { now.assume_init() })
}
