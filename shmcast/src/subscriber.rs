use std::{thread, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    layout::{Header, Locked, Mapping},
    registry::ReaderId,
    shm::ShmSafe,
    sync::{Deadline, WaitStatus},
    AttachError, ConsumeError, SyncError,
};

/// How a subscriber waits for a channel that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Failed attach attempts that return right away.
    pub immediate_attempts: u32,
    /// Sleep before each further attempt.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            immediate_attempts: 10,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    fn failed(&mut self) {
        if self.attempts < self.policy.immediate_attempts {
            self.attempts += 1;
        } else {
            thread::sleep(self.policy.backoff);
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[derive(Debug)]
enum Link<T> {
    Detached,
    Attached(Mapping<T>),
    Closed(ConsumeError),
}

impl<T: ShmSafe + Copy> Link<T> {
    fn get(&mut self, name: &str, backoff: &mut Backoff) -> Result<&Mapping<T>, ConsumeError> {
        if let Self::Detached = self {
            match Mapping::open(name) {
                Ok(mapping) => {
                    backoff.reset();
                    info!(name, "attached to channel");
                    *self = Self::Attached(mapping);
                }
                Err(err) if err.is_retryable() => {
                    backoff.failed();
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(name, %err, "giving up on channel");
                    *self = Self::Closed(err.clone().into());
                    return Err(err.into());
                }
            }
        }

        match self {
            Self::Attached(mapping) => Ok(mapping),
            Self::Closed(err) => Err(err.clone()),
            Self::Detached => Err(AttachError::Missing {
                name: name.to_owned(),
            }
            .into()),
        }
    }
}

/// Private read position of one subscriber.
#[derive(Debug, Default)]
struct Cursor {
    reader: Option<ReaderId>,
    index: usize,
    /// Publish count of the value read last.
    last_seq: u64,
    overruns: u64,
}

impl Cursor {
    /// Makes sure this cursor holds a live reader identity, claiming a new one
    /// if it never had one or it was revoked.
    fn join<T>(&mut self, locked: &mut Locked<'_, T>, name: &str) -> Result<ReaderId, ConsumeError> {
        let mut rejoin = false;
        if let Some(reader) = self.reader {
            if locked.registry.is_connected(reader) {
                return Ok(reader);
            }
            warn!(name, reader = reader.index(), "reader identity was revoked, reconnecting");
            self.reader = None;
            rejoin = true;
        }

        let reader = locked
            .registry
            .connect()
            .map_err(|_| ConsumeError::RegistryFull)?;

        // Ignore whatever an earlier holder of this identity left unread.
        let capacity = locked.capacity();
        for index in 0..capacity {
            locked.slot_mut(index).forget(reader);
        }

        let write_index = locked.write_index;
        if rejoin {
            // Keep the position and hand back only what was published since.
            let pending = locked.published.wrapping_sub(self.last_seq).min(capacity as u64);
            for back in 0..pending as usize {
                let index = (write_index + capacity - back) % capacity;
                // Every slot within `published` writes of `write_index` was stored.
                unsafe { locked.slot_mut(index).mark_unread(reader) };
            }
        } else {
            // Start at the latest value.
            if locked.published > 0 {
                unsafe { locked.slot_mut(write_index).mark_unread(reader) };
            }
            self.index = write_index;
            self.last_seq = locked.published.saturating_sub(1);
        }

        self.reader = Some(reader);
        info!(
            name,
            reader = reader.index(),
            readers = locked.registry.count(),
            rejoin,
            "connected to channel"
        );
        Ok(reader)
    }

    /// Jumps to the oldest value still in the ring if the publisher has
    /// overwritten values this reader never saw.
    fn skip_lapped<T>(&mut self, locked: &Locked<'_, T>, name: &str) {
        let capacity = locked.capacity() as u64;
        let behind = locked.published.wrapping_sub(self.last_seq);
        if behind <= capacity {
            return;
        }
        let lost = behind - capacity;
        self.overruns += lost;
        self.last_seq = locked.published - capacity;
        self.index = (locked.write_index + 1) % locked.capacity();
        debug!(name, lost, "reader was lapped");
    }

    fn consumed<T>(&mut self, locked: &Locked<'_, T>) {
        let capacity = locked.capacity();
        let distance = (locked.write_index + capacity - self.index) % capacity;
        self.last_seq = locked.published - distance as u64;
        self.advance(capacity);
    }

    fn advance(&mut self, capacity: usize) {
        self.index = (self.index + 1) % capacity;
    }
}

/// Reads values from a channel created by a [`Publisher`](crate::Publisher),
/// usually in another process.
///
/// Every subscriber sees every value at most once and in publish order. A
/// subscriber that falls more than a full ring behind skips to the oldest
/// value still available.
#[derive(Debug)]
pub struct Subscriber<T> {
    name: String,
    link: Link<T>,
    backoff: Backoff,
    cursor: Cursor,
}

impl<T: ShmSafe + Copy> Subscriber<T> {
    /// Attaches to an existing channel and fails if it is not available.
    pub fn attach(name: &str) -> Result<Self, AttachError> {
        let mapping = Mapping::open(name)?;
        info!(name, "attached to channel");
        Ok(Self::from_link(name, Link::Attached(mapping), ReconnectPolicy::default()))
    }

    /// Attaches lazily: a channel that does not exist yet is looked up again
    /// on every consume. Fails only for channels that can never be used.
    pub fn new(name: &str) -> Result<Self, AttachError> {
        Self::with_policy(name, ReconnectPolicy::default())
    }

    pub fn with_policy(name: &str, policy: ReconnectPolicy) -> Result<Self, AttachError> {
        let link = match Mapping::open(name) {
            Ok(mapping) => {
                info!(name, "attached to channel");
                Link::Attached(mapping)
            }
            Err(err) if err.is_retryable() => {
                debug!(name, "channel not available yet");
                Link::Detached
            }
            Err(err) => return Err(err),
        };
        Ok(Self::from_link(name, link, policy))
    }

    fn from_link(name: &str, link: Link<T>, policy: ReconnectPolicy) -> Self {
        Self {
            name: name.to_owned(),
            link,
            backoff: Backoff {
                policy,
                attempts: 0,
            },
            cursor: Cursor::default(),
        }
    }

    /// Claims a reader identity if this subscriber does not hold one yet.
    pub fn connect(&mut self) -> Result<ReaderId, ConsumeError> {
        let result = self.try_connect();
        self.check_closed(result)
    }

    /// Takes the next unread value, waiting up to `timeout` for one to be
    /// published. `None` waits without limit, zero does not wait at all.
    ///
    /// Once [`ConsumeError::Shutdown`] is returned after draining what was
    /// left, this subscriber stays closed. Create a new one to follow a
    /// restarted publisher.
    pub fn consume(&mut self, timeout: Option<Duration>) -> Result<T, ConsumeError> {
        let result = Deadline::after(timeout)
            .map_err(ConsumeError::from)
            .and_then(|deadline| self.consume_until(deadline));
        self.check_closed(result)
    }

    pub fn try_consume(&mut self) -> Result<T, ConsumeError> {
        self.consume(Some(Duration::ZERO))
    }

    fn try_connect(&mut self) -> Result<ReaderId, ConsumeError> {
        let mapping = self.link.get(&self.name, &mut self.backoff)?;
        let header = mapping.header();
        let mut locked = mapping.lock().map_err(|err| failure(header, err))?;
        self.cursor.join(&mut locked, &self.name)
    }

    fn consume_until(&mut self, deadline: Deadline) -> Result<T, ConsumeError> {
        let name = self.name.as_str();
        let cursor = &mut self.cursor;
        let mapping = self.link.get(name, &mut self.backoff)?;
        let header = mapping.header();
        let mut locked = mapping.lock().map_err(|err| failure(header, err))?;

        let mut expired = false;
        loop {
            let reader = cursor.join(&mut locked, name)?;
            cursor.skip_lapped(&locked, name);

            if let Some(value) = locked.slot_mut(cursor.index).take(reader) {
                cursor.consumed(&locked);
                return Ok(value);
            }

            if locked.published == cursor.last_seq {
                cursor.index = locked.write_index;
            } else if cursor.index != locked.write_index {
                cursor.advance(locked.capacity());
                continue;
            }

            if locked.shutdown {
                locked.registry.disconnect(reader);
                cursor.reader = None;
                info!(name, reader = reader.index(), "channel shut down, disconnected");
                return Err(ConsumeError::Shutdown);
            }
            if expired {
                return Err(ConsumeError::Empty);
            }

            let status = locked.wait(deadline).map_err(|err| failure(header, err))?;
            expired = status == WaitStatus::TimedOut;
        }
    }

    fn check_closed<R>(&mut self, result: Result<R, ConsumeError>) -> Result<R, ConsumeError> {
        if let Err(ConsumeError::Shutdown) = &result {
            self.cursor.reader = None;
            self.link = Link::Closed(ConsumeError::Shutdown);
        }
        result
    }
}

impl<T> Subscriber<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader_id(&self) -> Option<ReaderId> {
        self.cursor.reader
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.link, Link::Attached(_))
    }

    /// Whether this subscriber will never deliver data again.
    pub fn is_closed(&self) -> bool {
        matches!(self.link, Link::Closed(_))
    }

    /// Values this subscriber lost to being lapped.
    pub fn overruns(&self) -> u64 {
        self.cursor.overruns
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        let (Link::Attached(mapping), Some(reader)) = (&self.link, self.cursor.reader) else {
            return;
        };
        if !mapping.header().is_ready() {
            return;
        }
        match mapping.lock() {
            Ok(mut locked) => {
                locked.registry.disconnect(reader);
                info!(name = %self.name, reader = reader.index(), "disconnected from channel");
            }
            Err(err) => warn!(name = %self.name, %err, "failed to disconnect from channel"),
        }
    }
}

/// A lock or wait that fails after the publisher retired the region means
/// the channel is gone.
fn failure(header: &Header, err: SyncError) -> ConsumeError {
    if header.is_ready() {
        err.into()
    } else {
        ConsumeError::Shutdown
    }
}
