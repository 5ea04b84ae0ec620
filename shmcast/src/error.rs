use libc::c_int;
use rustix::io::Errno;
use thiserror::Error;
use tracing::error;

/// A pthread or clock call returned a failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op} failed: code {code}")]
pub struct SyncError {
    pub op: &'static str,
    pub code: c_int,
}

impl SyncError {
    pub fn new(op: &'static str, code: c_int) -> Self {
        Self { op, code }
    }

    pub(crate) fn logged(op: &'static str, code: c_int) -> Self {
        error!(op, code, "synchronization primitive failed");
        Self::new(op, code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("shared memory name is empty")]
    EmptyName,
    #[error("{op} failed for {name}: {errno}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        errno: Errno,
    },
    #[error("{name} is {len} bytes, expected at least {min}")]
    TooSmall { name: String, len: usize, min: usize },
}

impl RegionError {
    pub(crate) fn os(op: &'static str, name: &str, errno: Errno) -> Self {
        Self::Os {
            op,
            name: name.to_owned(),
            errno,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Os { errno, .. } if *errno == Errno::NOENT)
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Os { errno, .. } if *errno == Errno::EXIST)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateError {
    #[error("capacity must be at least 1")]
    ZeroCapacity,
    #[error("capacity {capacity} does not fit in the address space")]
    TooLarge { capacity: usize },
    #[error("channel {name} is owned by live process {pid}")]
    InUse { name: String, pid: u32 },
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    /// The region does not exist yet, is still being initialized, or was shut down.
    #[error("channel {name} is not available")]
    Missing { name: String },
    #[error("payload type mismatch: expected tag {expected:#018x}, region has {found:#018x}")]
    TypeMismatch { expected: u64, found: u64 },
    #[error("region layout mismatch: expected {expected} bytes, found {found}")]
    LayoutMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl AttachError {
    /// Only a missing region is worth retrying; everything else needs a different caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("channel has been shut down")]
    Shutdown,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    /// Nothing was published before the timeout ran out.
    #[error("no data before the timeout")]
    Empty,
    #[error("publisher has shut down the channel")]
    Shutdown,
    #[error("all reader identities are taken")]
    RegistryFull,
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ConsumeError {
    /// The subscriber instance that returned this will never deliver data again.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Shutdown => true,
            Self::Attach(err) => !err.is_retryable(),
            _ => false,
        }
    }
}
