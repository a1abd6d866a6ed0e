//! Fence handles
//!
//! A [`FenceHandle`] owns exactly one reference to a completion signal. It
//! cannot be copied; moving it is the only way to transfer ownership, and
//! dropping it closes the underlying descriptor. Handing a fence to another
//! owner while keeping one yourself goes through [`FenceHandle::dup`], which
//! produces a new, independent handle.
//!
//! Two backings exist:
//! - **Kernel**: a sync-file descriptor held as an [`OwnedFd`]; waiting polls
//!   the descriptor for readability.
//! - **Synthetic**: created from a [`FenceLedger`], signaled through a
//!   [`FenceSignal`]. The ledger records every create/duplicate/close event,
//!   which lets tests prove that each handle is closed exactly once.
//!
//! Merging two fences yields a handle that owns both and signals once both
//! have signaled.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Move-only reference to a completion signal
pub struct FenceHandle {
    kind: FenceKind,
}

enum FenceKind {
    Kernel(OwnedFd),
    Synthetic(SyntheticFence),
    Merged(Vec<FenceHandle>),
}

impl FenceHandle {
    /// Takes ownership of a sync-file descriptor
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self {
            kind: FenceKind::Kernel(fd),
        }
    }

    /// Duplicates the handle.
    ///
    /// Kernel fences are duplicated at the OS level, synthetic fences get a
    /// fresh ledger id sharing the same signal.
    pub fn dup(&self) -> io::Result<FenceHandle> {
        let kind = match &self.kind {
            FenceKind::Kernel(fd) => FenceKind::Kernel(fd.try_clone()?),
            FenceKind::Synthetic(fence) => FenceKind::Synthetic(fence.dup()),
            FenceKind::Merged(parts) => {
                let parts = parts.iter().map(FenceHandle::dup).collect::<io::Result<Vec<_>>>()?;
                FenceKind::Merged(parts)
            }
        };
        Ok(FenceHandle { kind })
    }

    /// Combines two fences into one that signals after both
    pub fn merge(a: FenceHandle, b: FenceHandle) -> FenceHandle {
        let mut parts = Vec::new();
        for fence in [a, b] {
            match fence.kind {
                FenceKind::Merged(inner) => parts.extend(inner),
                kind => parts.push(FenceHandle { kind }),
            }
        }
        FenceHandle {
            kind: FenceKind::Merged(parts),
        }
    }

    /// Merges two optional fences, keeping whichever exists
    pub fn merge_opt(a: Option<FenceHandle>, b: Option<FenceHandle>) -> Option<FenceHandle> {
        match (a, b) {
            (Some(a), Some(b)) => Some(FenceHandle::merge(a, b)),
            (a, b) => a.or(b),
        }
    }

    /// Blocks until the fence signals or `timeout` elapses.
    ///
    /// Returns `Ok(true)` when signaled.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        self.wait_until(deadline)
    }

    fn wait_until(&self, deadline: Instant) -> io::Result<bool> {
        match &self.kind {
            FenceKind::Kernel(fd) => poll_readable(fd, deadline),
            FenceKind::Synthetic(fence) => Ok(fence.signal.wait_until(deadline)),
            FenceKind::Merged(parts) => {
                for part in parts {
                    if !part.wait_until(deadline)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Non-blocking signal check
    pub fn is_signaled(&self) -> bool {
        self.wait(Duration::ZERO).unwrap_or(false)
    }

    /// Ledger id of a synthetic fence
    pub fn synthetic_id(&self) -> Option<u64> {
        match &self.kind {
            FenceKind::Synthetic(fence) => Some(fence.id),
            _ => None,
        }
    }

    /// Number of underlying signals owned by this handle
    pub fn component_count(&self) -> usize {
        match &self.kind {
            FenceKind::Merged(parts) => parts.iter().map(FenceHandle::component_count).sum(),
            _ => 1,
        }
    }
}

impl fmt::Debug for FenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FenceKind::Kernel(fd) => write!(f, "FenceHandle(fd={})", fd.as_raw_fd()),
            FenceKind::Synthetic(fence) => write!(f, "FenceHandle(synthetic#{})", fence.id),
            FenceKind::Merged(parts) => f.debug_tuple("FenceHandle::Merged").field(parts).finish(),
        }
    }
}

fn poll_readable(fd: &OwnedFd, deadline: Instant) -> io::Result<bool> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call and the
        // descriptor is kept open by `fd`.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        return Ok(rc > 0);
    }
}

/// Lifecycle event recorded by a [`FenceLedger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceEvent {
    Created(u64),
    Duplicated { from: u64, to: u64 },
    Closed(u64),
}

#[derive(Default)]
struct LedgerInner {
    next_id: u64,
    events: Vec<FenceEvent>,
}

/// Issues synthetic fences and records what happens to them
#[derive(Clone, Default)]
pub struct FenceLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl FenceLedger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unsignaled fence together with the signal that completes it
    pub fn create(&self) -> (FenceHandle, FenceSignal) {
        let signal = FenceSignal::new();
        let id = self.allocate_id();
        self.record(FenceEvent::Created(id));
        let fence = SyntheticFence {
            id,
            signal: signal.clone(),
            ledger: self.clone(),
        };
        (
            FenceHandle {
                kind: FenceKind::Synthetic(fence),
            },
            signal,
        )
    }

    /// Creates an already signaled fence
    pub fn create_signaled(&self) -> FenceHandle {
        let (fence, signal) = self.create();
        signal.signal();
        fence
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<FenceEvent> {
        self.inner.lock().events.clone()
    }

    /// Ids handed out (created or duplicated)
    pub fn issued(&self) -> Vec<u64> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                FenceEvent::Created(id) => Some(*id),
                FenceEvent::Duplicated { to, .. } => Some(*to),
                FenceEvent::Closed(_) => None,
            })
            .collect()
    }

    /// How many times the handle `id` was closed
    pub fn close_count(&self, id: u64) -> usize {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|event| **event == FenceEvent::Closed(id))
            .count()
    }

    /// Handles issued but not yet closed
    pub fn open_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut open = 0isize;
        for event in &inner.events {
            match event {
                FenceEvent::Created(_) | FenceEvent::Duplicated { .. } => open += 1,
                FenceEvent::Closed(_) => open -= 1,
            }
        }
        open.max(0) as usize
    }

    fn allocate_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.next_id
    }

    fn record(&self, event: FenceEvent) {
        self.inner.lock().events.push(event);
    }
}

impl fmt::Debug for FenceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FenceLedger")
            .field("issued", &inner.next_id)
            .field("events", &inner.events.len())
            .finish()
    }
}

struct SignalState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// Completes synthetic fences; cloned freely by producers
#[derive(Clone)]
pub struct FenceSignal {
    state: Arc<SignalState>,
}

impl FenceSignal {
    fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signals every fence sharing this signal
    pub fn signal(&self) {
        let mut signaled = self.state.signaled.lock();
        *signaled = true;
        self.state.cond.notify_all();
    }

    /// Whether `signal` has been called
    pub fn is_signaled(&self) -> bool {
        *self.state.signaled.lock()
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut signaled = self.state.signaled.lock();
        while !*signaled {
            if self.state.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

struct SyntheticFence {
    id: u64,
    signal: FenceSignal,
    ledger: FenceLedger,
}

impl SyntheticFence {
    fn dup(&self) -> SyntheticFence {
        let id = self.ledger.allocate_id();
        self.ledger.record(FenceEvent::Duplicated { from: self.id, to: id });
        SyntheticFence {
            id,
            signal: self.signal.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

impl Drop for SyntheticFence {
    fn drop(&mut self) {
        self.ledger.record(FenceEvent::Closed(self.id));
    }
}
