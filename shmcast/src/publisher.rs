use std::mem::size_of;

use libc::pid_t;
use tracing::{debug, error, info, warn};

use crate::{
    layout::{Header, Mapping, RegionLayout},
    shm::{Region, ShmSafe},
    CreateError, PublishError, RegionError, ShutdownToken, SyncError,
};

/// Owner of a channel region. Writes values into successive slots and wakes
/// every waiting subscriber.
///
/// Dropping the publisher shuts the channel down and removes its name, which
/// a later publisher may then reuse.
#[derive(Debug)]
pub struct Publisher<T> {
    mapping: Mapping<T>,
    token: ShutdownToken,
}

impl<T: ShmSafe + Copy> Publisher<T> {
    /// Creates the channel `name` with room for `capacity` values.
    ///
    /// A region left behind by a publisher that died or shut down is
    /// reclaimed. A region whose owner is still running is not touched.
    pub fn create(name: &str, capacity: usize) -> Result<Self, CreateError> {
        Self::with_token(name, capacity, ShutdownToken::new())
    }

    /// Like [`Publisher::create`], shutting the channel down on the next
    /// publish once `token` is cancelled.
    pub fn with_token(
        name: &str,
        capacity: usize,
        token: ShutdownToken,
    ) -> Result<Self, CreateError> {
        Self::try_create(name, capacity, token)
            .inspect_err(|err| error!(name, capacity, %err, "failed to create channel"))
    }

    fn try_create(name: &str, capacity: usize, token: ShutdownToken) -> Result<Self, CreateError> {
        if capacity == 0 {
            return Err(CreateError::ZeroCapacity);
        }
        let layout =
            RegionLayout::for_capacity::<T>(capacity).ok_or(CreateError::TooLarge { capacity })?;

        let region = match Region::create(name, layout.len) {
            Ok(region) => region,
            Err(err) if err.is_exists() => {
                reclaim(name)?;
                Region::create(name, layout.len)?
            }
            Err(err) => return Err(err.into()),
        };

        let mapping = unsafe { Mapping::initialize(region, capacity, layout) }?;
        info!(
            name = mapping.name(),
            capacity,
            bytes = layout.len,
            "channel created"
        );
        Ok(Self { mapping, token })
    }

    /// Writes `value` into the slot after the last written one.
    ///
    /// Never waits for readers. Values nobody read in time are overwritten.
    pub fn publish(&self, value: T) -> Result<(), PublishError> {
        if self.token.is_cancelled() {
            self.shutdown()?;
            return Err(PublishError::Shutdown);
        }

        let mut locked = self.mapping.lock()?;
        if locked.shutdown {
            return Err(PublishError::Shutdown);
        }

        let next = (locked.write_index + 1) % locked.capacity();
        locked.slot_mut(next).store(value);
        locked.write_index = next;
        locked.published = locked.published.wrapping_add(1);
        locked.broadcast()?;
        Ok(())
    }
}

impl<T> Publisher<T> {
    /// Marks the channel shut down and wakes all waiters. The region stays
    /// mapped so subscribers can drain what is left.
    pub fn shutdown(&self) -> Result<(), SyncError> {
        let mut locked = self.mapping.lock()?;
        self.token.cancel();
        if locked.shutdown {
            return Ok(());
        }
        locked.shutdown = true;
        locked.broadcast()?;
        info!(name = self.name(), published = locked.published, "channel shut down");
        Ok(())
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    pub fn capacity(&self) -> usize {
        self.mapping.capacity()
    }

    /// Number of connected subscribers.
    pub fn readers(&self) -> Result<usize, SyncError> {
        Ok(self.mapping.lock()?.registry.count())
    }

    pub fn write_index(&self) -> Result<usize, SyncError> {
        Ok(self.mapping.lock()?.write_index)
    }

    pub fn published(&self) -> Result<u64, SyncError> {
        Ok(self.mapping.lock()?.published)
    }

    pub fn is_shutdown(&self) -> Result<bool, SyncError> {
        Ok(self.mapping.lock()?.shutdown)
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(name = self.name(), %err, "failed to shut down channel");
        }

        let header = self.mapping.header();
        header.retire();

        // Connected subscribers still drain through the primitives.
        let readers = self.readers().unwrap_or(usize::MAX);
        if readers == 0 {
            unsafe {
                if let Err(err) = header.cond().close() {
                    warn!(name = self.name(), %err, "failed to close condvar");
                }
                if let Err(err) = header.state().close() {
                    warn!(name = self.name(), %err, "failed to close mutex");
                }
            }
        } else {
            debug!(name = self.name(), readers, "leaving primitives to connected readers");
        }
        info!(name = self.name(), "channel closed");
    }
}

/// Clears a name left behind by a publisher that is gone or done.
fn reclaim(name: &str) -> Result<(), CreateError> {
    let region = match Region::open(name, size_of::<Header>()) {
        Ok(region) => region,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(RegionError::TooSmall { len, .. }) => {
            warn!(name, len, "removing truncated channel region");
            return unlink_stale(name);
        }
        Err(err) => return Err(err.into()),
    };

    let header = unsafe { &*region.as_ptr().cast::<Header>() };
    let pid = header.owner_pid();
    if header.is_ready() {
        let mut state = header.state().lock()?;
        if !state.shutdown && process_alive(pid) {
            return Err(CreateError::InUse {
                name: region.name().to_owned(),
                pid,
            });
        }
        state.shutdown = true;
        header.cond().broadcast()?;
        drop(state);
        header.retire();
    } else if process_alive(pid) {
        return Err(CreateError::InUse {
            name: region.name().to_owned(),
            pid,
        });
    }

    warn!(name, pid, "reclaiming stale channel");
    unlink_stale(name)
}

fn unlink_stale(name: &str) -> Result<(), CreateError> {
    match Region::unlink(name) {
        Err(err) if !err.is_not_found() => Err(err.into()),
        _ => Ok(()),
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn liveness_of_processes() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn publish_advances_the_ring() {
        let name = format!("/shmcast-pub-{}", std::process::id());
        let publisher = Publisher::<u64>::create(&name, 3).unwrap();
        assert_eq!(publisher.write_index().unwrap(), 0);

        for value in 0..4 {
            publisher.publish(value).unwrap();
        }
        assert_eq!(publisher.write_index().unwrap(), 1);
        assert_eq!(publisher.published().unwrap(), 4);
        assert_eq!(publisher.readers().unwrap(), 0);

        publisher.shutdown().unwrap();
        publisher.shutdown().unwrap();
        assert!(publisher.is_shutdown().unwrap());
        assert_eq!(publisher.publish(5), Err(PublishError::Shutdown));
    }

    #[test]
    fn cancelled_token_shuts_down() {
        let name = format!("/shmcast-pub-token-{}", std::process::id());
        let token = ShutdownToken::new();
        let publisher = Publisher::<u32>::with_token(&name, 2, token.clone()).unwrap();
        publisher.publish(1).unwrap();

        token.cancel();
        assert_eq!(publisher.publish(2), Err(PublishError::Shutdown));
        assert!(publisher.is_shutdown().unwrap());
        assert_eq!(publisher.published().unwrap(), 1);
    }
}
