use crate::error::{MuxError, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Identifier of a virtual socket on the wire.
///
/// Positive values name user sockets and are handed out by a
/// [`SocketIdAllocator`]. Negative values are reserved system channels that
/// exist on every connection group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(i32);

impl SocketId {
    /// Synchronous responses to back-channel requests.
    pub const CONTROL: SocketId = SocketId(-1);
    /// Incoming connect requests for the group's acceptor.
    pub const SERVER_ACCEPT: SocketId = SocketId(-2);
    /// Answers to connect requests.
    pub const ACCEPT_ANSWER: SocketId = SocketId(-3);
    /// Client confirmation that an answered connect completed.
    pub const ACCEPT_VERIFY: SocketId = SocketId(-4);
    /// Asynchronous notifications and requests.
    pub const BACK_CHANNEL: SocketId = SocketId(-5);
    /// Sink for payload that cannot be routed.
    pub const DEAD_LETTER: SocketId = SocketId(-6);

    pub const fn new(value: i32) -> Self {
        SocketId(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    pub fn is_user(self) -> bool {
        self.0 > 0
    }

    pub fn is_system(self) -> bool {
        matches!(
            self,
            SocketId::CONTROL
                | SocketId::SERVER_ACCEPT
                | SocketId::ACCEPT_ANSWER
                | SocketId::ACCEPT_VERIFY
                | SocketId::BACK_CHANNEL
                | SocketId::DEAD_LETTER
        )
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for SocketId {
    fn from(value: i32) -> Self {
        SocketId(value)
    }
}

#[derive(Debug)]
struct AllocatorState {
    /// Next never-issued id, or the scan cursor once wrapped.
    cursor: i32,
    wrapped: bool,
    in_use: HashSet<i32>,
}

/// Process-scoped source of user socket ids.
///
/// Ids are issued from a monotonically increasing counter until it passes
/// `max`; after that the allocator wraps and scans forward for ids returned
/// through [`release`](Self::release). When every id is held, allocation waits
/// for a release up to the caller's deadline.
#[derive(Debug)]
pub struct SocketIdAllocator {
    max: i32,
    state: Mutex<AllocatorState>,
    released: Notify,
}

impl SocketIdAllocator {
    pub fn new(max: i32) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(AllocatorState {
                cursor: 1,
                wrapped: false,
                in_use: HashSet::new(),
            }),
            released: Notify::new(),
        }
    }

    /// Allocates an id, waiting up to `timeout` if the space is saturated.
    pub async fn allocate(&self, timeout: Duration) -> Result<SocketId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_allocate() {
                return Ok(id);
            }

            tracing::debug!("socket id space exhausted, waiting for a release");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(MuxError::IdSpaceExhausted);
            }
        }
    }

    /// Allocates an id without waiting.
    pub fn try_allocate(&self) -> Option<SocketId> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.in_use.len() >= self.max as usize {
            return None;
        }

        if !state.wrapped {
            let id = state.cursor;
            if id < self.max {
                state.cursor += 1;
            } else {
                state.wrapped = true;
                state.cursor = 1;
            }
            state.in_use.insert(id);
            return Some(SocketId(id));
        }

        // Wrapped: scan forward for an evicted id. Termination is guaranteed
        // because fewer than `max` ids are in use.
        loop {
            let id = state.cursor;
            state.cursor = if id >= self.max { 1 } else { id + 1 };
            if state.in_use.insert(id) {
                return Some(SocketId(id));
            }
        }
    }

    /// Returns `id` to the free set and wakes one waiting allocator.
    pub fn release(&self, id: SocketId) {
        let removed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_use.remove(&id.0)
        };
        if removed {
            self.released.notify_one();
        }
    }

    pub fn is_allocated(&self, id: SocketId) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_use.contains(&id.0)
    }

    pub fn in_use(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_use.len()
    }

    pub fn max(&self) -> i32 {
        self.max
    }
}
