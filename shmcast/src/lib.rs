//! Broker-less publish/subscribe over POSIX shared memory.
//!
//! A [`Publisher`] creates a named region holding a header and a ring of
//! fixed-size slots. Up to [`MAX_READERS`] [`Subscriber`]s, usually living in
//! other processes, attach to the same name and consume the ring at their own
//! pace. All coordination happens through a robust, process-shared mutex and
//! condition variable stored in the region itself.

use std::time::Duration;

use libc::c_int;

pub mod error;
pub mod layout;
pub mod publisher;
pub mod registry;
pub mod sample;
pub mod shm;
pub mod shutdown;
pub mod slot;
pub mod subscriber;
pub mod sync;

pub use error::{AttachError, ConsumeError, CreateError, PublishError, RegionError, SyncError};
pub use layout::{type_tag, RegionLayout};
pub use publisher::Publisher;
pub use registry::{ConnectionRegistry, ReaderId, RegistryFull};
pub use sample::ImuSample;
pub use shm::ShmSafe;
pub use shutdown::ShutdownToken;
pub use subscriber::{ReconnectPolicy, Subscriber};

/// Number of reader identities a region can hand out.
pub const MAX_READERS: usize = u32::BITS as usize;

/// Timeout the demo binaries use for a single consume call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

pub trait CheckOk<R> {
    fn r(self, op: &'static str) -> Result<R, SyncError>;
}

impl CheckOk<()> for c_int {
    fn r(self, op: &'static str) -> Result<(), SyncError> {
        if self != 0 {
            return Err(SyncError::logged(op, self));
        }
        Ok(())
    }
}
