#![forbid(unsafe_code)]
//! Per-vertex reentrant writer / shared reader lock packed into 64 bits.
//!
//! Layout of [`VertexDescriptor`], least significant bit first:
//!
//! | bits   | field                                             |
//! |--------|---------------------------------------------------|
//! | 0..32  | writer thread tag (or pending write requester)    |
//! | 32..40 | property flags                                    |
//! | 40..45 | lock bits `lck rwl wrq iny yib`                   |
//! | 45     | suspended context bit                             |
//! | 46..48 | manifestation                                     |
//! | 48..56 | vertex type                                       |
//! | 56..64 | semaphore (write recursion or reader count, `i8`) |
//!
//! Only the ten combinations enumerated by [`LockState`] are ever stored in
//! the lock bits. Protocol violations (locking without checking, unlocking a
//! lock held by someone else) panic.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::types::{Result, SombraError, ThreadTag};

/// Maximum write recursion for one owner.
pub const MAX_WRITE_RECURSION: i8 = 112;
/// Maximum number of concurrent readers.
pub const MAX_READERS: i8 = 112;

const WRITER_MASK: u64 = 0xFFFF_FFFF;
const PROPERTY_SHIFT: u32 = 32;
const LOCK_SHIFT: u32 = 40;
const LOCK_MASK: u64 = 0x1F;
const SUSPENDED_BIT: u64 = 1 << 45;
const MAN_SHIFT: u32 = 46;
const MAN_MASK: u64 = 0x3;
const TYPE_SHIFT: u32 = 48;
const SEM_SHIFT: u32 = 56;

const LCK: u8 = 1 << 0;
const RWL: u8 = 1 << 1;
const WRQ: u8 = 1 << 2;
const INY: u8 = 1 << 3;
const YIB: u8 = 1 << 4;

/// The legal lock-bit combinations (`yib iny wrq rwl lck`).
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LockState {
    /// Unlocked.
    Idle = 0b00000,
    /// Held by one writer, possibly recursively.
    Writable = 0b00001,
    /// Shared by one or more readers.
    Readonly = 0b00011,
    /// Readers present and a writer waiting.
    ReadonlyWreq = 0b00111,
    /// Writer has yielded the inbound arcs.
    WritableYieldIn = 0b01001,
    /// Yielded inbound arcs are borrowed.
    WritableInBusy = 0b11001,
    ReadonlyYieldIn = 0b01011,
    ReadonlyInBusy = 0b11011,
    ReadonlyYieldInWreq = 0b01111,
    ReadonlyInBusyWreq = 0b11111,
}

impl LockState {
    /// Every legal state, in bit order.
    pub const ALL: [LockState; 10] = [
        LockState::Idle,
        LockState::Writable,
        LockState::Readonly,
        LockState::ReadonlyWreq,
        LockState::WritableYieldIn,
        LockState::WritableInBusy,
        LockState::ReadonlyYieldIn,
        LockState::ReadonlyInBusy,
        LockState::ReadonlyYieldInWreq,
        LockState::ReadonlyInBusyWreq,
    ];

    /// `None` for bit patterns that are not a legal state.
    pub fn from_bits(bits: u8) -> Option<Self> {
        LockState::ALL.into_iter().find(|state| state.bits() == bits)
    }

    /// Raw five lock bits.
    pub const fn bits(self) -> u8 {
        self as u8
    }

    pub const fn is_locked(self) -> bool {
        self.bits() & LCK != 0
    }

    pub const fn is_readonly(self) -> bool {
        self.bits() & RWL != 0
    }

    /// Locked and not shared.
    pub const fn is_writable(self) -> bool {
        self.is_locked() && !self.is_readonly()
    }

    /// A writer is queued behind the readers.
    pub const fn write_requested(self) -> bool {
        self.bits() & WRQ != 0
    }

    pub const fn inarcs_yielded(self) -> bool {
        self.bits() & INY != 0
    }

    pub const fn inarcs_borrowed(self) -> bool {
        self.bits() & YIB != 0
    }

    fn compose(bits: u8) -> Self {
        LockState::from_bits(bits)
            .unwrap_or_else(|| panic!("illegal vertex lock transition to {bits:05b}"))
    }
}

/// Vertex manifestation stored in the context bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Manifestation {
    Null = 0,
    Real = 1,
    /// Placeholder without backing data.
    Virtual = 2,
}

/// Vertex type enumeration byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VertexType(pub u8);

impl VertexType {
    /// Unassigned.
    pub const NONE: VertexType = VertexType(0x00);
    /// Plain graph vertex.
    pub const VERTEX: VertexType = VertexType(0x11);
    /// Vertex used only as a lock.
    pub const LOCKOBJECT: VertexType = VertexType(0x12);
    pub const NONEXIST: VertexType = VertexType(0x19);
    pub const DEFUNCT: VertexType = VertexType(0x1d);
    pub const INCOMPLETE: VertexType = VertexType(0x1e);
    pub const NOACCESS: VertexType = VertexType(0x1f);
    /// First type byte available to applications.
    pub const USER_FIRST: u8 = 0x20;
    /// Last type byte available to applications.
    pub const USER_LAST: u8 = 0xef;
    pub const NO_MAPPING: VertexType = VertexType(0xf1);
    pub const INVALID: VertexType = VertexType(0xf2);
    pub const LOCKED: VertexType = VertexType(0xf9);
    pub const COLLISION: VertexType = VertexType(0xfc);
    /// Catch-all error marker.
    pub const ERROR: VertexType = VertexType(0xfe);

    /// Reserved test types `0x0a..=0x0c`.
    pub const fn is_test(self) -> bool {
        self.0 >= 0x0a && self.0 <= 0x0c
    }

    /// Within [`Self::USER_FIRST`]..=[`Self::USER_LAST`].
    pub const fn is_user(self) -> bool {
        self.0 >= Self::USER_FIRST && self.0 <= Self::USER_LAST
    }
}

/// Property flag byte.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PropertyFlags(pub u8);

impl PropertyFlags {
    /// Vertex is present in the main index.
    pub const INDEX_MAIN: u8 = 1 << 0;
    pub const INDEX_TYPE: u8 = 1 << 1;
    /// An event is pending for this vertex.
    pub const EVENT_SCHEDULED: u8 = 1 << 2;
    pub const SCOPE_DEFINED: u8 = 1 << 3;
    /// Carries a vector payload.
    pub const VECTOR: u8 = 1 << 4;
    pub const CENTROID: u8 = 1 << 5;
    pub const DEGREE_OUT: u8 = 1 << 6;
    pub const DEGREE_IN: u8 = 1 << 7;

    /// True when every bit of `flag` is set.
    pub const fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// The packed 64-bit vertex record.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct VertexDescriptor(u64);

impl VertexDescriptor {
    pub fn new(vxtype: VertexType) -> Self {
        let mut descriptor = VertexDescriptor(0);
        descriptor.set_type(vxtype);
        descriptor.set_manifestation(Manifestation::Real);
        descriptor
    }

    /// Packed representation.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Wraps bits read back from storage without validation.
    pub const fn from_raw(bits: u64) -> Self {
        VertexDescriptor(bits)
    }

    /// Panics if the stored lock bits are not a legal state.
    pub fn lock_state(self) -> LockState {
        LockState::compose(((self.0 >> LOCK_SHIFT) & LOCK_MASK) as u8)
    }

    fn set_lock_state(&mut self, state: LockState) {
        self.0 &= !(LOCK_MASK << LOCK_SHIFT);
        self.0 |= u64::from(state.bits()) << LOCK_SHIFT;
    }

    fn update_lock_bits(&mut self, set: u8, clear: u8) {
        let bits = (self.lock_state().bits() | set) & !clear;
        self.set_lock_state(LockState::compose(bits));
    }

    /// Thread tag of the writer, or of the pending write requester.
    pub fn writer(self) -> Option<ThreadTag> {
        match (self.0 & WRITER_MASK) as u32 {
            0 => None,
            tag => Some(ThreadTag(tag)),
        }
    }

    fn set_writer(&mut self, writer: Option<ThreadTag>) {
        self.0 &= !WRITER_MASK;
        self.0 |= u64::from(writer.map_or(0, |tag| tag.0));
    }

    /// Write recursion depth or reader count, depending on the lock state.
    pub fn semaphore(self) -> i8 {
        (self.0 >> SEM_SHIFT) as u8 as i8
    }

    fn set_semaphore(&mut self, count: i8) {
        self.0 &= !(0xFF << SEM_SHIFT);
        self.0 |= u64::from(count as u8) << SEM_SHIFT;
    }

    pub fn properties(self) -> PropertyFlags {
        PropertyFlags((self.0 >> PROPERTY_SHIFT) as u8)
    }

    pub fn set_properties(&mut self, flags: PropertyFlags) {
        self.0 &= !(0xFF << PROPERTY_SHIFT);
        self.0 |= u64::from(flags.0) << PROPERTY_SHIFT;
    }

    pub fn vertex_type(self) -> VertexType {
        VertexType((self.0 >> TYPE_SHIFT) as u8)
    }

    pub fn set_type(&mut self, vxtype: VertexType) {
        self.0 &= !(0xFF << TYPE_SHIFT);
        self.0 |= u64::from(vxtype.0) << TYPE_SHIFT;
    }

    /// Unknown encodings read as [`Manifestation::Null`].
    pub fn manifestation(self) -> Manifestation {
        match (self.0 >> MAN_SHIFT) & MAN_MASK {
            1 => Manifestation::Real,
            2 => Manifestation::Virtual,
            _ => Manifestation::Null,
        }
    }

    pub fn set_manifestation(&mut self, man: Manifestation) {
        self.0 &= !(MAN_MASK << MAN_SHIFT);
        self.0 |= (man as u64) << MAN_SHIFT;
    }

    /// Set while the owning context is suspended.
    pub fn is_suspended(self) -> bool {
        self.0 & SUSPENDED_BIT != 0
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        if suspended {
            self.0 |= SUSPENDED_BIT;
        } else {
            self.0 &= !SUSPENDED_BIT;
        }
    }

    pub fn is_locked(self) -> bool {
        self.lock_state().is_locked()
    }

    /// Whether `tid` currently holds the write lock.
    pub fn is_writable_by(self, tid: ThreadTag) -> bool {
        self.lock_state().is_writable() && self.writer() == Some(tid)
    }

    /// Whether [`Self::lock_writable`] would succeed for `tid`.
    ///
    /// Free vertices qualify unless reserved by another requester; the owner
    /// qualifies while under [`MAX_WRITE_RECURSION`].
    pub fn lockable_as_writable(self, tid: ThreadTag) -> bool {
        let state = self.lock_state();
        if !state.is_locked() {
            // A reservation left behind by a write request belongs to its requester.
            return self.writer().map_or(true, |owner| owner == tid);
        }
        state.is_writable() && self.writer() == Some(tid) && self.semaphore() < MAX_WRITE_RECURSION
    }

    /// Returns the recursion count after locking.
    pub fn lock_writable(&mut self, tid: ThreadTag) -> i8 {
        assert!(
            self.lockable_as_writable(tid),
            "vertex not lockable as writable by thread {tid}"
        );
        if self.is_locked() {
            let count = self.semaphore() + 1;
            self.set_semaphore(count);
            return count;
        }
        self.set_lock_state(LockState::Writable);
        self.set_writer(Some(tid));
        self.set_semaphore(1);
        1
    }

    /// Returns the remaining recursion count.
    pub fn unlock_writable(&mut self, tid: ThreadTag) -> i8 {
        assert!(
            self.is_writable_by(tid),
            "vertex unlock_writable by non-owner thread {tid}"
        );
        let count = self.semaphore();
        assert!(count > 0, "vertex write recursion underflow");
        let remaining = count - 1;
        self.set_semaphore(remaining);
        if remaining == 0 {
            assert!(
                !self.lock_state().inarcs_borrowed(),
                "vertex released while inarcs are borrowed"
            );
            self.set_lock_state(LockState::Idle);
            self.set_writer(None);
        }
        remaining
    }

    /// Free, or shared with fewer than [`MAX_READERS`] readers.
    pub fn lockable_as_readonly(self) -> bool {
        let state = self.lock_state();
        !state.is_locked() || (state.is_readonly() && self.semaphore() < MAX_READERS)
    }

    /// Returns the reader count after locking.
    pub fn lock_readonly(&mut self) -> i8 {
        assert!(self.lockable_as_readonly(), "vertex not lockable as readonly");
        if self.is_locked() {
            let count = self.semaphore() + 1;
            self.set_semaphore(count);
            return count;
        }
        self.set_lock_state(LockState::Readonly);
        self.set_semaphore(1);
        1
    }

    /// Returns the remaining reader count.
    pub fn unlock_readonly(&mut self) -> i8 {
        let state = self.lock_state();
        assert!(state.is_readonly(), "vertex unlock_readonly while not readonly");
        let count = self.semaphore();
        assert!(count > 0, "vertex reader count underflow");
        let remaining = count - 1;
        self.set_semaphore(remaining);
        if remaining == 0 {
            assert!(
                !state.inarcs_borrowed(),
                "vertex released while inarcs are borrowed"
            );
            // The requester tag survives in the writer field as a reservation.
            if !state.write_requested() {
                self.set_writer(None);
            }
            self.set_lock_state(LockState::Idle);
        }
        remaining
    }

    /// Records a write request; only effective on a readonly vertex with no request yet.
    pub fn set_write_requested(&mut self, tid: ThreadTag) -> bool {
        let state = self.lock_state();
        if !state.is_readonly() || state.write_requested() {
            return false;
        }
        self.update_lock_bits(WRQ, 0);
        self.set_writer(Some(tid));
        true
    }

    /// Withdraws a write request (or its reservation) made by `tid`.
    pub fn clear_write_requested(&mut self, tid: ThreadTag) -> bool {
        if self.writer() != Some(tid) {
            return false;
        }
        let state = self.lock_state();
        if state.write_requested() {
            self.update_lock_bits(0, WRQ);
            self.set_writer(None);
            true
        } else if !state.is_locked() {
            self.set_writer(None);
            true
        } else {
            false
        }
    }

    /// Whether another thread may walk the inbound arcs right now.
    pub fn inarcs_available(self) -> bool {
        let state = self.lock_state();
        !state.is_locked() || (state.inarcs_yielded() && !state.inarcs_borrowed())
    }

    /// Lets one other thread traverse the inbound arcs of a locked vertex.
    pub fn yield_inarcs(&mut self, tid: ThreadTag) {
        let state = self.lock_state();
        assert!(state.is_locked(), "cannot yield inarcs of an unlocked vertex");
        if state.is_writable() {
            assert!(self.writer() == Some(tid), "inarcs yielded by non-owner thread {tid}");
        }
        self.update_lock_bits(INY, 0);
    }

    /// False unless the arcs are yielded and not already borrowed.
    pub fn borrow_inarcs(&mut self) -> bool {
        if !self.lock_state().inarcs_yielded() || self.lock_state().inarcs_borrowed() {
            return false;
        }
        self.update_lock_bits(YIB, 0);
        true
    }

    /// Panics if the arcs are not borrowed.
    pub fn return_inarcs(&mut self) {
        assert!(
            self.lock_state().inarcs_borrowed(),
            "inarcs returned without being borrowed"
        );
        self.update_lock_bits(0, YIB);
    }

    /// Takes back yielded inarcs; false while another thread still borrows them.
    pub fn reclaim_inarcs(&mut self) -> bool {
        let state = self.lock_state();
        if state.inarcs_borrowed() {
            return false;
        }
        if state.inarcs_yielded() {
            self.update_lock_bits(0, INY);
        }
        true
    }
}

impl fmt::Debug for VertexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VertexDescriptor")
            .field("lock", &self.lock_state())
            .field("writer", &self.writer())
            .field("semaphore", &self.semaphore())
            .field("type", &self.vertex_type())
            .field("man", &self.manifestation())
            .field("suspended", &self.is_suspended())
            .field("properties", &self.properties())
            .finish()
    }
}

/// A descriptor behind a mutex with blocking, timed acquisition.
pub struct VertexLock {
    descriptor: Mutex<VertexDescriptor>,
    released: Condvar,
}

impl VertexLock {
    pub fn new(vxtype: VertexType) -> Self {
        Self {
            descriptor: Mutex::new(VertexDescriptor::new(vxtype)),
            released: Condvar::new(),
        }
    }

    /// Copy of the current descriptor.
    pub fn snapshot(&self) -> VertexDescriptor {
        *self.descriptor.lock()
    }

    /// Runs `f` on the descriptor and wakes waiters afterwards.
    pub fn update<R>(&self, f: impl FnOnce(&mut VertexDescriptor) -> R) -> R {
        let result = f(&mut self.descriptor.lock());
        self.released.notify_all();
        result
    }

    /// Blocks until the vertex is writable by the caller. `None` waits forever.
    pub fn acquire_writable(&self, timeout: Option<Duration>) -> Result<i8> {
        let tid = ThreadTag::current();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut requested = false;
        let mut guard = self.descriptor.lock();
        loop {
            if guard.lockable_as_writable(tid) {
                let count = guard.lock_writable(tid);
                trace!(tid = tid.0, count, "vertex.lock_writable");
                return Ok(count);
            }
            if !requested && guard.set_write_requested(tid) {
                requested = true;
            }
            if !self.wait(&mut guard, deadline) {
                if requested {
                    guard.clear_write_requested(tid);
                    self.released.notify_all();
                }
                return Err(SombraError::Timeout("vertex writable lock"));
            }
        }
    }

    /// Drops one level of write recursion, waking waiters at zero.
    pub fn release_writable(&self) -> i8 {
        let tid = ThreadTag::current();
        let remaining = self.descriptor.lock().unlock_writable(tid);
        if remaining == 0 {
            self.released.notify_all();
        }
        remaining
    }

    /// Blocks until a reader slot is free. `None` waits forever.
    pub fn acquire_readonly(&self, timeout: Option<Duration>) -> Result<i8> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.descriptor.lock();
        loop {
            if guard.lockable_as_readonly() {
                return Ok(guard.lock_readonly());
            }
            if !self.wait(&mut guard, deadline) {
                return Err(SombraError::Timeout("vertex readonly lock"));
            }
        }
    }

    /// Drops one reader. Waiters wake when the vertex becomes free or a
    /// reader slot opens below [`MAX_READERS`].
    pub fn release_readonly(&self) -> i8 {
        let remaining = self.descriptor.lock().unlock_readonly();
        if remaining == 0 || remaining == MAX_READERS - 1 {
            self.released.notify_all();
        }
        remaining
    }

    fn wait(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, VertexDescriptor>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            None => {
                self.released.wait(guard);
                true
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                self.released.wait_for(guard, deadline - now);
                true
            }
        }
    }
}

impl fmt::Debug for VertexLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VertexLock").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn other_thread() -> ThreadTag {
        std::thread::spawn(ThreadTag::current).join().unwrap()
    }

    #[test]
    fn descriptor_bit_positions() {
        let mut d = VertexDescriptor::from_raw(0);
        d.set_type(VertexType::VERTEX);
        assert_eq!(d.bits(), 0x0011_0000_0000_0000);
        let mut d = VertexDescriptor::from_raw(0);
        d.set_semaphore(-1);
        assert_eq!(d.bits(), 0xFF00_0000_0000_0000);
        let mut d = VertexDescriptor::from_raw(0);
        d.set_lock_state(LockState::ReadonlyWreq);
        assert_eq!(d.bits(), 0x0000_0700_0000_0000);
        let mut d = VertexDescriptor::from_raw(0);
        d.set_manifestation(Manifestation::Virtual);
        assert_eq!(d.bits(), 0x0000_8000_0000_0000);
        d.set_suspended(true);
        assert_eq!(d.bits(), 0x0000_A000_0000_0000);
    }

    #[test]
    fn only_ten_lock_states_decode() {
        let legal = (0u8..32).filter(|b| LockState::from_bits(*b).is_some()).count();
        assert_eq!(legal, 10);
    }

    #[test]
    fn reentrant_writable_lock_returns_to_idle() {
        let tid = ThreadTag::current();
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        assert!(d.lockable_as_writable(tid));
        assert_eq!(d.lock_writable(tid), 1);
        assert_eq!(d.lock_state(), LockState::Writable);
        assert!(d.lockable_as_writable(tid));
        assert_eq!(d.lock_writable(tid), 2);
        assert_eq!(d.unlock_writable(tid), 1);
        assert_eq!(d.unlock_writable(tid), 0);
        assert_eq!(d.lock_state(), LockState::Idle);
        assert_eq!(d.writer(), None);
    }

    #[test]
    fn other_thread_cannot_reenter() {
        let tid = ThreadTag::current();
        let other = other_thread();
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        d.lock_writable(tid);
        assert!(!d.lockable_as_writable(other));
        assert!(!d.lockable_as_readonly());
    }

    #[test]
    fn recursion_cap_is_enforced() {
        let tid = ThreadTag::current();
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        for _ in 0..MAX_WRITE_RECURSION {
            d.lock_writable(tid);
        }
        assert!(!d.lockable_as_writable(tid));
        let mut r = VertexDescriptor::new(VertexType::VERTEX);
        for _ in 0..MAX_READERS {
            r.lock_readonly();
        }
        assert!(!r.lockable_as_readonly());
    }

    #[test]
    fn write_request_is_redeemed_by_requester() {
        let me = ThreadTag::current();
        let other = other_thread();
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        d.lock_readonly();
        assert!(d.set_write_requested(me));
        assert!(!d.set_write_requested(other));
        assert_eq!(d.lock_state(), LockState::ReadonlyWreq);
        // Readers are not blocked by the request.
        assert!(d.lockable_as_readonly());
        assert_eq!(d.unlock_readonly(), 0);
        assert_eq!(d.lock_state(), LockState::Idle);
        assert!(!d.lockable_as_writable(other));
        assert!(d.lockable_as_writable(me));
        d.lock_writable(me);
        assert_eq!(d.writer(), Some(me));
        d.unlock_writable(me);
        assert!(d.lockable_as_writable(other));
    }

    #[test]
    fn inarcs_yield_and_borrow() {
        let tid = ThreadTag::current();
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        assert!(d.inarcs_available());
        d.lock_writable(tid);
        assert!(!d.inarcs_available());
        d.yield_inarcs(tid);
        assert_eq!(d.lock_state(), LockState::WritableYieldIn);
        assert!(d.inarcs_available());
        assert!(d.borrow_inarcs());
        assert_eq!(d.lock_state(), LockState::WritableInBusy);
        assert!(!d.inarcs_available());
        assert!(!d.borrow_inarcs());
        assert!(!d.reclaim_inarcs());
        d.return_inarcs();
        assert!(d.reclaim_inarcs());
        assert_eq!(d.lock_state(), LockState::Writable);
        d.unlock_writable(tid);
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn unlock_by_non_owner_panics() {
        let other = other_thread();
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        d.lock_writable(ThreadTag::current());
        d.unlock_writable(other);
    }

    #[test]
    #[should_panic(expected = "not readonly")]
    fn unlock_readonly_on_idle_panics() {
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        d.unlock_readonly();
    }

    #[test]
    fn blocking_acquire_times_out() {
        let lock = Arc::new(VertexLock::new(VertexType::VERTEX));
        lock.acquire_writable(None).unwrap();
        let contender = Arc::clone(&lock);
        let err = std::thread::spawn(move || {
            contender.acquire_readonly(Some(Duration::from_millis(20)))
        })
        .join()
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, SombraError::Timeout(_)));
        assert_eq!(lock.release_writable(), 0);
    }

    #[test]
    fn blocked_writer_wakes_after_readers_leave() {
        let lock = Arc::new(VertexLock::new(VertexType::VERTEX));
        lock.acquire_readonly(None).unwrap();
        let writer = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            let count = writer.acquire_writable(Some(Duration::from_secs(5)))?;
            writer.release_writable();
            Ok::<i8, SombraError>(count)
        });
        let waited = Instant::now();
        while lock.snapshot().lock_state() != LockState::ReadonlyWreq {
            assert!(waited.elapsed() < Duration::from_secs(2), "write request never set");
            std::thread::sleep(Duration::from_millis(1));
        }
        lock.release_readonly();
        assert_eq!(handle.join().unwrap().unwrap(), 1);
        assert_eq!(lock.snapshot().lock_state(), LockState::Idle);
        assert_eq!(lock.snapshot().writer(), None);
    }
}
