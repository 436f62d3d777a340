//! Atomic reference counts for one control block.
//!
//! [`RefCount`] is the count state machine shared by [`Strong`] and
//! [`Weak`] handles: a strong counter governing the lifetime of the
//! managed value and a weak counter governing the lifetime of the block
//! itself. The counters are only ever mutated through atomic
//! read-modify-write operations; the transition decisions (destroy the
//! value, free the block) are returned to the caller, which must act on
//! them exactly once.
//!
//! [`Strong`]: crate::handle::Strong
//! [`Weak`]: crate::handle::Weak

use std::process::abort;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicUsize};

/// A soft limit on the number of references to one block.
///
/// Going above this limit aborts the program (although not necessarily
/// at exactly `MAX_REFCOUNT + 1` references).
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Sentinel marking the weak counter as locked by [`RefCount::is_unique`].
const WEAK_LOCKED: usize = usize::MAX;

/// The two atomic counters of a control block.
///
/// All strong handles collectively hold one unit of the weak counter.
/// That unit is given up when the strong counter reaches zero, so the
/// block is freed by exactly one thread: the one whose weak decrement
/// performs the final 1 -> 0 transition. [`weak_count`] subtracts the
/// unit again, so callers observe the number of weak handles only.
///
/// [`weak_count`]: RefCount::weak_count
#[derive(Debug)]
pub struct RefCount {
    strong: AtomicUsize,
    weak: AtomicUsize,
}

impl RefCount {
    /// Constructs a new `RefCount` with one strong reference.
    pub fn new() -> Self {
        Self {
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
        }
    }

    /// Returns the number of strong references.
    pub fn strong_count(&self) -> usize {
        self.strong.load(SeqCst)
    }

    /// Returns the number of weak references, not counting the unit
    /// held collectively by the strong references.
    pub fn weak_count(&self) -> usize {
        let weak = self.weak.load(SeqCst);
        if weak == WEAK_LOCKED {
            // The counter is only locked while a strong handle checks
            // for uniqueness, so no weak handle exists right now.
            return 0;
        }
        if self.strong.load(SeqCst) > 0 {
            weak - 1
        } else {
            weak
        }
    }

    /// Increases the strong count by one.
    ///
    /// Aborts the program if the counter is saturated.
    ///
    /// # Safety
    ///
    /// The caller must already own a strong reference; the counter must
    /// be at least one for the plain increment to be race-free.
    pub unsafe fn increase_strong(&self) {
        // Knowledge of an existing strong reference prevents other
        // threads from concurrently destroying the value, so Relaxed
        // suffices here.
        let old = self.strong.fetch_add(1, Relaxed);
        record_rmw();

        if old > MAX_REFCOUNT {
            abort();
        }
    }

    /// Decreases the strong count by one.
    ///
    /// Returns `true` exactly when this call performed the 1 -> 0
    /// transition. The caller must then destroy the managed value and
    /// afterwards give up the strong side's weak unit via
    /// [`decrease_weak`](RefCount::decrease_weak).
    ///
    /// # Safety
    ///
    /// The caller must own a strong reference, which is consumed.
    pub unsafe fn decrease_strong(&self) -> bool {
        let old = self.strong.fetch_sub(1, Release);
        record_rmw();
        debug_assert!(old != 0, "strong count underflow");

        if old != 1 {
            return false;
        }

        // Orders all prior accesses to the value before its destruction
        // by this thread.
        fence(Acquire);
        true
    }

    /// Increases the weak count by one.
    ///
    /// Spins while the counter is locked by a concurrent
    /// [`is_unique`](RefCount::is_unique) check. Aborts the program if
    /// the counter is saturated.
    ///
    /// # Safety
    ///
    /// The caller must own a strong or weak reference to the block.
    pub unsafe fn increase_weak(&self) {
        let mut cur = self.weak.load(Relaxed);

        loop {
            if cur == WEAK_LOCKED {
                std::hint::spin_loop();
                cur = self.weak.load(Relaxed);
                continue;
            }

            if cur > MAX_REFCOUNT {
                abort();
            }

            // Acquire pairs with the Release unlock in `is_unique`, so
            // its read of the strong counter cannot drift past this
            // increment.
            match self.weak.compare_exchange_weak(cur, cur + 1, Acquire, Relaxed) {
                Ok(_) => {
                    record_rmw();
                    return;
                }
                Err(old) => cur = old,
            }
        }
    }

    /// Decreases the weak count by one.
    ///
    /// Returns `true` exactly when this call performed the final
    /// 1 -> 0 transition; the caller must then free the block.
    ///
    /// # Safety
    ///
    /// The caller must own a weak reference, which is consumed.
    pub unsafe fn decrease_weak(&self) -> bool {
        let old = self.weak.fetch_sub(1, Release);
        record_rmw();
        debug_assert!(old != 0 && old != WEAK_LOCKED, "weak count underflow");

        if old != 1 {
            return false;
        }

        // Orders the value's destruction before the block is freed.
        fence(Acquire);
        true
    }

    /// Attempts to convert a weak reference into a strong one.
    ///
    /// Uses a compare-and-swap retry loop: a plain read-then-increment
    /// would race with a concurrent release dropping the counter to
    /// zero and destroying the value after the read but before the
    /// increment. On success the value is guaranteed not to have been
    /// destroyed; on failure it is already (or about to be) destroyed.
    ///
    /// Failure is an expected outcome, not an error.
    ///
    /// # Safety
    ///
    /// The caller must own a weak reference to the block.
    pub unsafe fn upgrade_strong(&self) -> bool {
        let mut cur = self.strong.load(Relaxed);

        loop {
            if cur == 0 {
                return false;
            }

            if cur > MAX_REFCOUNT {
                abort();
            }

            match self
                .strong
                .compare_exchange_weak(cur, cur + 1, Acquire, Relaxed)
            {
                Ok(_) => {
                    record_rmw();
                    return true;
                }
                Err(old) => cur = old,
            }
        }
    }

    /// Returns whether exactly one strong and no weak references exist.
    ///
    /// Briefly locks the weak counter so that a concurrent `downgrade`
    /// cannot slip in between the two reads.
    pub fn is_unique(&self) -> bool {
        if self
            .weak
            .compare_exchange(1, WEAK_LOCKED, Acquire, Relaxed)
            .is_ok()
        {
            // Acquire synchronizes with the Release decrement of the
            // strong counter in handle drops.
            let unique = self.strong.load(Acquire) == 1;
            self.weak.store(1, Release);
            unique
        } else {
            false
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[inline]
fn record_rmw() {
    ops::record();
}

#[cfg(not(test))]
#[inline(always)]
fn record_rmw() {}

/// Per-thread tally of count-mutating atomic operations, used by the
/// unit tests to verify that ownership transfer performs none.
#[cfg(test)]
pub(crate) mod ops {
    use std::cell::Cell;

    thread_local! {
        static RMW: Cell<usize> = const { Cell::new(0) };
    }

    pub(crate) fn record() {
        RMW.with(|c| c.set(c.get() + 1));
    }

    pub(crate) fn observed() -> usize {
        RMW.with(Cell::get)
    }
}

#[cfg(test)]
mod tests {
    use super::RefCount;

    #[test]
    fn fresh_counts() {
        let rc = RefCount::new();
        assert_eq!(rc.strong_count(), 1);
        assert_eq!(rc.weak_count(), 0);
        assert!(rc.is_unique());
    }

    #[test]
    fn upgrade_fails_at_zero() {
        let rc = RefCount::new();
        // Safety: the test owns the single strong reference.
        assert!(unsafe { rc.decrease_strong() });
        // Safety: the strong side's weak unit is still counted.
        assert!(unsafe { rc.decrease_weak() });
        // Safety: the block outlives the test.
        assert!(!unsafe { rc.upgrade_strong() });
    }

    #[test]
    fn upgrade_succeeds_while_strong() {
        let rc = RefCount::new();
        // Safety: a strong reference exists.
        unsafe { rc.increase_weak() };
        assert_eq!(rc.weak_count(), 1);
        // Safety: a weak reference exists.
        assert!(unsafe { rc.upgrade_strong() });
        assert_eq!(rc.strong_count(), 2);
    }

    #[test]
    fn uniqueness_sees_weak_refs() {
        let rc = RefCount::new();
        assert!(rc.is_unique());
        // Safety: a strong reference exists.
        unsafe { rc.increase_weak() };
        assert!(!rc.is_unique());
        // Safety: the weak reference taken above is given up.
        assert!(!unsafe { rc.decrease_weak() });
        assert!(rc.is_unique());
    }

    #[test]
    fn strong_side_owns_one_weak_unit() {
        let rc = RefCount::new();
        // Safety: the test owns the single strong reference.
        assert!(unsafe { rc.decrease_strong() });
        assert_eq!(rc.strong_count(), 0);
        // The collective unit has not been given up yet; it is what
        // keeps the block alive until `decrease_weak` below.
        assert_eq!(rc.weak_count(), 1);
        // Safety: giving up the collective unit.
        assert!(unsafe { rc.decrease_weak() });
    }
}
