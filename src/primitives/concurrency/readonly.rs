#![forbid(unsafe_code)]
//! Cluster-wide readonly mode layered over the graph state lock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::graph_lock::GraphGuard;
use crate::types::{Result, SombraError, ThreadTag};

/// Maximum concurrent readonly holders of a graph.
pub const MAX_READONLY_READERS: i32 = 32000;
/// Maximum writers allowed to queue behind a readonly graph.
pub const MAX_WRITERS_WAITING: i32 = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const EMITTER_SUSPEND_TIMEOUT: Duration = Duration::from_secs(120);

/// A background subsystem that must be quiet while the graph is readonly.
pub trait Suspendable: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the subsystem is running and not already suspended.
    fn is_running(&self) -> bool;

    /// Returns true when this call did the suspending.
    fn suspend(&self, timeout: Duration) -> Result<bool>;

    fn resume(&self) -> Result<()>;
}

/// What the coordinator needs from the graph it manages.
pub trait ReadonlyHost {
    /// Number of vertices currently locked writable.
    fn writable_vertices(&self) -> usize;

    fn event_processor(&self) -> Option<&dyn Suspendable>;

    fn emitter(&self) -> Option<&dyn Suspendable>;

    fn tx_input(&self) -> Option<std::sync::Arc<dyn Suspendable>>;

    /// Records the readonly (`grr`) or readwrite (`grw`) transition in the
    /// operation stream and closes or reopens the graph operation.
    fn capture_transition(&self, readonly: bool);
}

/// Subsystems that were suspended by entering readonly mode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ResumeFlags {
    pub event_processor: bool,
    pub emitter: bool,
    pub tx_input: bool,
}

/// Per-graph readonly counters.
#[derive(Clone, Debug, Default)]
pub struct ReadonlyState {
    /// Graph is currently readonly.
    pub readonly: bool,
    /// Readonly holds, explicit ones included.
    pub readers: i32,
    /// Holds taken through an explicit readonly request.
    pub explicit: i32,
    /// Nested [`ReadonlyCoordinator::disallow`] calls.
    pub disallow: i32,
    pub writers_waiting: i32,
    /// Thread inside a transition, and its nesting depth.
    pub transition_owner: Option<ThreadTag>,
    pub transition_depth: u32,
    /// Subsystems to resume when the graph turns writable.
    pub resume: ResumeFlags,
}

/// Flips a graph between writable and readonly.
#[derive(Debug, Default)]
pub struct ReadonlyCoordinator {
    state: Mutex<ReadonlyState>,
}

impl ReadonlyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mode.
    pub fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    /// Copy of the counters.
    pub fn snapshot(&self) -> ReadonlyState {
        self.state.lock().clone()
    }

    pub fn readers(&self) -> i32 {
        self.state.lock().readers
    }

    /// Blocks readonly transitions until the matching [`allow`](Self::allow).
    pub fn disallow(&self) {
        self.state.lock().disallow += 1;
    }

    pub fn allow(&self) {
        let mut st = self.state.lock();
        assert!(st.disallow > 0, "readonly allow without matching disallow");
        st.disallow -= 1;
    }

    /// Registers a writer waiting for the graph to become writable.
    pub fn begin_writer_wait(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.writers_waiting >= MAX_WRITERS_WAITING {
            return Err(SombraError::Busy("too many writers waiting on readonly graph"));
        }
        st.writers_waiting += 1;
        Ok(())
    }

    pub fn end_writer_wait(&self) {
        let mut st = self.state.lock();
        if st.writers_waiting > 0 {
            st.writers_waiting -= 1;
        }
    }

    /// Adds an implicit reader to a graph that is already readonly.
    pub fn add_reader(&self) -> Result<i32> {
        let mut st = self.state.lock();
        if !st.readonly {
            return Err(SombraError::Invalid("graph is not readonly"));
        }
        Self::add_reader_locked(&mut st)
    }

    pub fn remove_reader(&self) -> i32 {
        let mut st = self.state.lock();
        assert!(
            st.readonly && st.readers > st.explicit,
            "readonly reader count out of range"
        );
        st.readers -= 1;
        st.readers
    }

    fn add_reader_locked(st: &mut ReadonlyState) -> Result<i32> {
        if st.readers >= MAX_READONLY_READERS {
            return Err(SombraError::Busy("too many readonly readers"));
        }
        if st.writers_waiting > 0 {
            return Err(SombraError::Busy("writers waiting for readonly graph"));
        }
        st.readers += 1;
        Ok(st.readers)
    }

    /// Makes the graph readonly (or joins an existing readonly period).
    ///
    /// Returns the reader count. On failure nothing the call changed remains
    /// changed.
    pub fn acquire_readonly(
        &self,
        guard: &mut GraphGuard<'_>,
        host: &dyn ReadonlyHost,
        timeout: Option<Duration>,
        force: bool,
    ) -> Result<i32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.enter_transition(guard, deadline)?;
        let result = self.transition_to_readonly(guard, host, deadline, force);
        self.leave_transition();
        guard.lock().signal();
        result
    }

    /// Drops one explicit readonly hold; the last one makes the graph writable
    /// and returns the subsystems that were resumed.
    pub fn release_readonly(
        &self,
        guard: &mut GraphGuard<'_>,
        host: &dyn ReadonlyHost,
    ) -> Result<Option<ResumeFlags>> {
        {
            let mut st = self.state.lock();
            if !st.readonly {
                return Err(SombraError::Invalid("graph is not readonly"));
            }
            assert!(
                st.explicit > 0 && st.readers >= st.explicit,
                "readonly release without a matching acquire"
            );
            st.readers -= 1;
            st.explicit -= 1;
            if st.readers > 0 {
                return Ok(None);
            }
        }
        self.clear_readonly(guard, host).map(Some)
    }

    /// Leaves readonly mode. The reader count must already be zero.
    pub fn clear_readonly(
        &self,
        guard: &mut GraphGuard<'_>,
        host: &dyn ReadonlyHost,
    ) -> Result<ResumeFlags> {
        let flags = {
            let mut st = self.state.lock();
            if !st.readonly {
                return Err(SombraError::Invalid("graph is not readonly"));
            }
            assert!(
                st.readers == 0,
                "cannot leave readonly with {} active readers",
                st.readers
            );
            st.readonly = false;
            st.explicit = 0;
            std::mem::take(&mut st.resume)
        };
        if flags.emitter {
            if let Some(emitter) = host.emitter() {
                if let Err(err) = emitter.resume() {
                    warn!(error = %err, "readonly.leave.emitter_resume_failed");
                }
            }
        }
        host.capture_transition(false);
        if flags.event_processor {
            if let Some(evp) = host.event_processor() {
                if let Err(err) = guard.suspend(|| evp.resume()) {
                    warn!(error = %err, "readonly.leave.event_processor_resume_failed");
                }
            }
        }
        if flags.tx_input {
            if let Some(tx) = host.tx_input() {
                if let Err(err) = guard.suspend(|| tx.resume()) {
                    warn!(error = %err, "readonly.leave.tx_input_resume_failed");
                }
            }
        }
        info!(?flags, "readonly.writable");
        guard.lock().signal();
        Ok(flags)
    }

    fn enter_transition(&self, guard: &mut GraphGuard<'_>, deadline: Option<Instant>) -> Result<()> {
        let tag = ThreadTag::current();
        loop {
            {
                let mut st = self.state.lock();
                match st.transition_owner {
                    None => {
                        st.transition_owner = Some(tag);
                        st.transition_depth = 1;
                        return Ok(());
                    }
                    Some(owner) if owner == tag => {
                        st.transition_depth += 1;
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            let wait = remaining(deadline).ok_or(SombraError::Timeout("readonly transition"))?;
            guard.wait_signal(wait.min(POLL_INTERVAL));
        }
    }

    fn leave_transition(&self) {
        let mut st = self.state.lock();
        assert!(
            st.transition_owner == Some(ThreadTag::current()) && st.transition_depth > 0,
            "readonly transition released by non-owner"
        );
        st.transition_depth -= 1;
        if st.transition_depth == 0 {
            st.transition_owner = None;
        }
    }

    fn transition_to_readonly(
        &self,
        guard: &mut GraphGuard<'_>,
        host: &dyn ReadonlyHost,
        deadline: Option<Instant>,
        force: bool,
    ) -> Result<i32> {
        {
            let mut st = self.state.lock();
            if st.readonly {
                let readers = Self::add_reader_locked(&mut st)?;
                st.explicit += 1;
                return Ok(readers);
            }
            assert!(st.readers == 0, "readonly readers present on a writable graph");
        }

        let mut flags = ResumeFlags::default();
        if let Some(tx) = host.tx_input() {
            let budget = budget(deadline);
            match guard.suspend(|| tx.suspend(budget)) {
                Ok(here) => flags.tx_input = here,
                Err(err) if force => {
                    warn!(error = %err, "readonly.enter.forced_despite_tx_input");
                }
                Err(err) => return Err(err),
            }
        }

        match self.suspend_and_lock(guard, host, deadline, force, &mut flags) {
            Ok(readers) => {
                info!(readers, ?flags, "readonly.enter");
                Ok(readers)
            }
            Err(err) => {
                if flags.event_processor {
                    if let Some(evp) = host.event_processor() {
                        if let Err(resume_err) = guard.suspend(|| evp.resume()) {
                            warn!(error = %resume_err, "readonly.revert.event_processor_resume_failed");
                        }
                    }
                }
                if flags.tx_input {
                    if let Some(tx) = host.tx_input() {
                        if let Err(resume_err) = guard.suspend(|| tx.resume()) {
                            warn!(error = %resume_err, "readonly.revert.tx_input_resume_failed");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn suspend_and_lock(
        &self,
        guard: &mut GraphGuard<'_>,
        host: &dyn ReadonlyHost,
        deadline: Option<Instant>,
        force: bool,
        flags: &mut ResumeFlags,
    ) -> Result<i32> {
        while self.state.lock().disallow > 0 {
            match remaining(deadline) {
                Some(wait) => {
                    guard.wait_signal(wait.min(POLL_INTERVAL));
                }
                None => break,
            }
        }
        let disallow = self.state.lock().disallow;
        if disallow > 0 {
            if !force {
                return Err(SombraError::Busy("readonly transition disallowed"));
            }
            warn!(disallow, "readonly.enter.forced_despite_disallow");
        }

        if let Some(evp) = host.event_processor().filter(|evp| evp.is_running()) {
            let budget = budget(deadline);
            match guard.suspend(|| evp.suspend(budget)) {
                Ok(true) => flags.event_processor = true,
                Ok(false) | Err(_) if force => {
                    warn!("readonly.enter.forced_despite_event_processor");
                }
                Ok(false) => return Err(SombraError::Busy("event processor did not suspend")),
                Err(err) => return Err(err),
            }
        }

        let mut writable = host.writable_vertices();
        while writable > 0 {
            match remaining(deadline) {
                Some(wait) => {
                    guard.wait_signal(wait.min(POLL_INTERVAL));
                    writable = host.writable_vertices();
                }
                None => break,
            }
        }
        if writable > 0 {
            if !force {
                return Err(SombraError::Timeout("writable vertices remain"));
            }
            warn!(writable, "readonly.enter.forced_despite_writable_vertices");
        }

        host.capture_transition(true);
        if let Some(emitter) = host.emitter().filter(|emitter| emitter.is_running()) {
            match guard.suspend(|| emitter.suspend(EMITTER_SUSPEND_TIMEOUT)) {
                Ok(here) => flags.emitter = here,
                Err(err) if force => {
                    warn!(error = %err, "readonly.enter.forced_despite_emitter");
                }
                Err(err) => {
                    host.capture_transition(false);
                    return Err(err);
                }
            }
        }

        let mut st = self.state.lock();
        st.readonly = true;
        st.writers_waiting = 0;
        st.resume = *flags;
        st.readers = 1;
        st.explicit = 1;
        Ok(st.readers)
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(POLL_INTERVAL),
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| deadline - now)
        }
    }
}

fn budget(deadline: Option<Instant>) -> Duration {
    match deadline {
        None => EMITTER_SUSPEND_TIMEOUT,
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::concurrency::GraphStateLock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Flag {
        running: AtomicBool,
        suspends: AtomicUsize,
        resumes: AtomicUsize,
        refuse_resume: AtomicBool,
    }

    impl Suspendable for Flag {
        fn name(&self) -> &'static str {
            "flag"
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn suspend(&self, _timeout: Duration) -> Result<bool> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(self.running.swap(false, Ordering::SeqCst))
        }

        fn resume(&self) -> Result<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            if self.refuse_resume.load(Ordering::SeqCst) {
                return Err(SombraError::Closed("flag"));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Host {
        writable: AtomicUsize,
        evp: Flag,
        emitter: Flag,
        tx: Arc<Flag>,
        transitions: parking_lot::Mutex<Vec<bool>>,
    }

    impl ReadonlyHost for Host {
        fn writable_vertices(&self) -> usize {
            self.writable.load(Ordering::SeqCst)
        }

        fn event_processor(&self) -> Option<&dyn Suspendable> {
            Some(&self.evp)
        }

        fn emitter(&self) -> Option<&dyn Suspendable> {
            Some(&self.emitter)
        }

        fn tx_input(&self) -> Option<Arc<dyn Suspendable>> {
            Some(self.tx.clone())
        }

        fn capture_transition(&self, readonly: bool) {
            self.transitions.lock().push(readonly);
        }
    }

    fn running_host() -> Host {
        let host = Host::default();
        host.evp.running.store(true, Ordering::SeqCst);
        host.emitter.running.store(true, Ordering::SeqCst);
        host.tx.running.store(true, Ordering::SeqCst);
        host
    }

    #[test]
    fn enter_and_leave_restores_subsystems() -> Result<()> {
        let lock = GraphStateLock::new();
        let host = running_host();
        let ro = ReadonlyCoordinator::new();
        let mut guard = lock.lock(None)?;
        assert_eq!(ro.acquire_readonly(&mut guard, &host, Some(Duration::from_secs(1)), false)?, 1);
        assert!(ro.is_readonly());
        assert!(!host.evp.is_running());
        assert!(!host.emitter.is_running());
        assert!(!host.tx.is_running());
        let flags = ro.release_readonly(&mut guard, &host)?.expect("graph became writable");
        assert_eq!(
            flags,
            ResumeFlags {
                event_processor: true,
                emitter: true,
                tx_input: true
            }
        );
        assert!(!ro.is_readonly());
        assert!(host.evp.is_running() && host.emitter.is_running() && host.tx.is_running());
        assert_eq!(*host.transitions.lock(), vec![true, false]);
        let after = ro.snapshot();
        assert_eq!((after.readers, after.explicit, after.writers_waiting), (0, 0, 0));
        Ok(())
    }

    #[test]
    fn nested_acquire_counts_readers() -> Result<()> {
        let lock = GraphStateLock::new();
        let host = running_host();
        let ro = ReadonlyCoordinator::new();
        let mut guard = lock.lock(None)?;
        ro.acquire_readonly(&mut guard, &host, None, false)?;
        assert_eq!(ro.acquire_readonly(&mut guard, &host, None, false)?, 2);
        assert_eq!(ro.release_readonly(&mut guard, &host)?, None);
        assert!(ro.is_readonly());
        assert!(ro.release_readonly(&mut guard, &host)?.is_some());
        Ok(())
    }

    #[test]
    fn writable_vertices_cause_timeout_without_side_effects() -> Result<()> {
        let lock = GraphStateLock::new();
        let host = running_host();
        host.writable.store(1, Ordering::SeqCst);
        let ro = ReadonlyCoordinator::new();
        let mut guard = lock.lock(None)?;
        let err = ro
            .acquire_readonly(&mut guard, &host, Some(Duration::from_millis(30)), false)
            .unwrap_err();
        assert!(matches!(err, SombraError::Timeout(_)));
        assert!(!ro.is_readonly());
        assert!(host.evp.is_running());
        assert!(host.tx.is_running());
        assert!(host.emitter.is_running());
        assert!(host.transitions.lock().is_empty());
        Ok(())
    }

    #[test]
    fn failed_resume_on_revert_keeps_the_original_error() -> Result<()> {
        let lock = GraphStateLock::new();
        let host = running_host();
        host.writable.store(1, Ordering::SeqCst);
        host.tx.refuse_resume.store(true, Ordering::SeqCst);
        let ro = ReadonlyCoordinator::new();
        let mut guard = lock.lock(None)?;
        let err = ro
            .acquire_readonly(&mut guard, &host, Some(Duration::from_millis(30)), false)
            .unwrap_err();
        assert!(matches!(err, SombraError::Timeout(_)));
        assert_eq!(host.tx.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(host.evp.resumes.load(Ordering::SeqCst), 1);
        assert!(host.evp.is_running());
        assert!(!ro.is_readonly());
        Ok(())
    }

    #[test]
    fn disallowed_transition_fails_unless_forced() -> Result<()> {
        let lock = GraphStateLock::new();
        let host = running_host();
        let ro = ReadonlyCoordinator::new();
        ro.disallow();
        let mut guard = lock.lock(None)?;
        let err = ro
            .acquire_readonly(&mut guard, &host, Some(Duration::from_millis(20)), false)
            .unwrap_err();
        assert!(matches!(err, SombraError::Busy(_)));
        assert_eq!(ro.acquire_readonly(&mut guard, &host, Some(Duration::from_millis(20)), true)?, 1);
        ro.allow();
        ro.release_readonly(&mut guard, &host)?;
        Ok(())
    }

    #[test]
    fn waiting_writers_block_new_readers() -> Result<()> {
        let lock = GraphStateLock::new();
        let host = running_host();
        let ro = ReadonlyCoordinator::new();
        let mut guard = lock.lock(None)?;
        ro.acquire_readonly(&mut guard, &host, None, false)?;
        ro.begin_writer_wait()?;
        assert!(matches!(ro.add_reader(), Err(SombraError::Busy(_))));
        ro.end_writer_wait();
        assert_eq!(ro.add_reader()?, 2);
        assert_eq!(ro.remove_reader(), 1);
        ro.release_readonly(&mut guard, &host)?;
        Ok(())
    }

    #[test]
    #[should_panic(expected = "active readers")]
    fn clearing_with_readers_is_fatal() {
        let lock = GraphStateLock::new();
        let host = running_host();
        let ro = ReadonlyCoordinator::new();
        let mut guard = lock.lock(None).unwrap();
        ro.acquire_readonly(&mut guard, &host, None, false).unwrap();
        let _ = ro.clear_readonly(&mut guard, &host);
    }
}
