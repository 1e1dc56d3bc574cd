#![forbid(unsafe_code)]
//! Reentrant per-graph critical section.
//!
//! The recursion depth is visible to callers so a holder can release every
//! level, block on the graph's change signal, and come back at the same depth.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, SombraError, ThreadTag};

#[derive(Default)]
struct Owner {
    tag: Option<ThreadTag>,
    depth: u32,
}

/// Reentrant mutex with explicit `release_all` / `reacquire`.
#[derive(Default)]
pub struct GraphStateLock {
    owner: Mutex<Owner>,
    handoff: Condvar,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl GraphStateLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the critical section; `None` waits indefinitely.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<GraphGuard<'_>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        if self.enter(1, deadline) {
            Ok(GraphGuard { lock: self })
        } else {
            Err(SombraError::Timeout("graph state lock"))
        }
    }

    pub fn try_lock(&self) -> Option<GraphGuard<'_>> {
        self.enter(1, Some(Instant::now()))
            .then(|| GraphGuard { lock: self })
    }

    /// Recursion depth held by the calling thread (zero when not the owner).
    pub fn depth(&self) -> u32 {
        let owner = self.owner.lock();
        if owner.tag == Some(ThreadTag::current()) {
            owner.depth
        } else {
            0
        }
    }

    pub fn is_held_by_current(&self) -> bool {
        self.depth() > 0
    }

    /// Releases every recursion level held by the caller and returns the depth.
    pub fn release_all(&self) -> u32 {
        let mut owner = self.owner.lock();
        assert!(
            owner.tag == Some(ThreadTag::current()),
            "graph state lock released by non-owner"
        );
        let depth = owner.depth;
        owner.tag = None;
        owner.depth = 0;
        self.handoff.notify_one();
        depth
    }

    /// Reenters the critical section at `depth` levels.
    pub fn reacquire(&self, depth: u32, timeout: Option<Duration>) -> Result<()> {
        assert!(depth > 0, "graph state lock reacquired at depth zero");
        let deadline = timeout.map(|t| Instant::now() + t);
        if self.enter(depth, deadline) {
            Ok(())
        } else {
            Err(SombraError::Timeout("graph state lock"))
        }
    }

    /// Wakes every thread blocked in [`GraphGuard::wait_signal`].
    pub fn signal(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    fn enter(&self, levels: u32, deadline: Option<Instant>) -> bool {
        let tag = ThreadTag::current();
        let mut owner = self.owner.lock();
        loop {
            match owner.tag {
                None => {
                    owner.tag = Some(tag);
                    owner.depth = levels;
                    return true;
                }
                Some(current) if current == tag => {
                    owner.depth += levels;
                    return true;
                }
                Some(_) => match deadline {
                    None => self.handoff.wait(&mut owner),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return false;
                        }
                        self.handoff.wait_for(&mut owner, deadline - now);
                    }
                },
            }
        }
    }

    fn leave(&self) {
        let mut owner = self.owner.lock();
        assert!(
            owner.tag == Some(ThreadTag::current()) && owner.depth > 0,
            "graph state lock released by non-owner"
        );
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.tag = None;
            self.handoff.notify_one();
        }
    }
}

impl fmt::Debug for GraphStateLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.owner.lock();
        f.debug_struct("GraphStateLock")
            .field("owner", &owner.tag)
            .field("depth", &owner.depth)
            .finish()
    }
}

/// One recursion level of a [`GraphStateLock`]; dropping it leaves that level.
pub struct GraphGuard<'a> {
    lock: &'a GraphStateLock,
}

impl<'a> GraphGuard<'a> {
    pub fn lock(&self) -> &'a GraphStateLock {
        self.lock
    }

    pub fn depth(&self) -> u32 {
        self.lock.depth()
    }

    /// Runs `f` with the graph fully released, then restores the same depth.
    pub fn suspend<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let depth = self.lock.release_all();
        let result = f();
        self.lock.enter(depth, None);
        result
    }

    /// Releases the graph and blocks until signalled or `timeout` elapses.
    ///
    /// Returns true when a signal arrived.
    pub fn wait_signal(&mut self, timeout: Duration) -> bool {
        let seen = *self.lock.generation.lock();
        let lock = self.lock;
        self.suspend(|| {
            let mut generation = lock.generation.lock();
            if *generation == seen {
                lock.changed.wait_for(&mut generation, timeout);
            }
            *generation != seen
        })
    }
}

impl Drop for GraphGuard<'_> {
    fn drop(&mut self) {
        self.lock.leave();
    }
}
