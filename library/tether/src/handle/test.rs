use super::{Strong, Weak};
use crate::allocator::{BlockAllocator, SystemAllocator};
use crate::refcount::ops;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::alloc::Layout;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::thread;

struct DropProbe<'a>(&'a RefCell<usize>);

impl Drop for DropProbe<'_> {
    fn drop(&mut self) {
        *self.0.borrow_mut() += 1;
    }
}

struct AtomicProbe<'a>(&'a AtomicUsize);

impl Drop for AtomicProbe<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Relaxed);
    }
}

#[test]
fn uninhabited() {
    enum Void {}
    let a = Weak::<Void>::new();
    assert!(a.upgrade().is_none());
    assert_eq!(a.weak_count(), 0);
}

#[test]
fn float_nan_ne() {
    let x = Strong::new(f32::NAN);
    assert_ne!(x, x);
    assert!(!(x == x));
}

#[test]
fn partial_eq() {
    struct TestPEq(RefCell<usize>);
    impl PartialEq for TestPEq {
        fn eq(&self, other: &TestPEq) -> bool {
            *self.0.borrow_mut() += 1;
            *other.0.borrow_mut() += 1;
            true
        }
    }
    let x = Strong::new(TestPEq(RefCell::new(0)));
    assert!(x == x);
    assert!(!(x != x));
    assert_eq!(*x.0.borrow(), 4);
}

#[test]
fn drop_runs_once() {
    let drops = RefCell::new(0);
    let x = Strong::new(DropProbe(&drops));
    assert_eq!(*drops.borrow(), 0);

    let y = x.clone();
    drop(x);
    assert_eq!(*drops.borrow(), 0);

    drop(y);
    assert_eq!(*drops.borrow(), 1);
}

#[test]
fn clone_tracks_strong_count() {
    let x = Strong::new(5);
    assert_eq!(Strong::strong_count(&x), 1);

    let y = x.clone();
    assert_eq!(Strong::strong_count(&x), 2);
    assert!(Strong::ptr_eq(&x, &y));

    drop(y);
    assert_eq!(Strong::strong_count(&x), 1);
}

#[test]
fn empty_handles() {
    let empty = Strong::<i32>::default();
    assert!(Strong::is_empty(&empty));
    assert_eq!(Strong::get(&empty), None);
    assert_eq!(Strong::strong_count(&empty), 0);
    assert_eq!(Strong::weak_count(&empty), 0);
    assert!(Strong::as_ptr(&empty).is_null());

    let clone = empty.clone();
    assert!(Strong::is_empty(&clone));
    assert!(Strong::ptr_eq(&empty, &clone));

    let weak = Strong::downgrade(&empty);
    assert!(Weak::is_empty(&weak));
    assert!(weak.upgrade().is_none());
}

#[test]
#[should_panic(expected = "dereferenced an empty strong handle")]
fn deref_empty_panics() {
    let empty = Strong::<i32>::empty();
    let _ = *empty;
}

#[test]
fn take_leaves_source_empty() {
    let drops = RefCell::new(0);
    let mut a = Strong::new(DropProbe(&drops));
    let b = a.clone();
    assert_eq!(Strong::strong_count(&b), 2);

    let moved = Strong::take(&mut a);
    assert!(Strong::is_empty(&a));
    assert!(Strong::ptr_eq(&moved, &b));
    // Transfer never changes either count.
    assert_eq!(Strong::strong_count(&b), 2);
    assert_eq!(Strong::weak_count(&b), 0);

    drop(a);
    drop(moved);
    assert_eq!(*drops.borrow(), 0);
    drop(b);
    assert_eq!(*drops.borrow(), 1);
}

#[test]
fn weak_counts_track_handles() {
    let s = Strong::new(1);
    let w1 = Strong::downgrade(&s);
    let w2 = w1.clone();
    assert_eq!(Strong::weak_count(&s), 2);
    assert_eq!(w1.weak_count(), 2);
    assert_eq!(w1.strong_count(), 1);
    assert!(Weak::ptr_eq(&w1, &w2));

    let mut w3 = w2.clone();
    let moved = Weak::take(&mut w3);
    assert!(Weak::is_empty(&w3));
    assert_eq!(Strong::weak_count(&s), 3);

    drop(moved);
    drop(w3);
    drop(w2);
    drop(w1);
    assert_eq!(Strong::weak_count(&s), 0);
}

// The scripted lifecycle: owner, weak observer, promotion, staggered
// releases, failed late promotion.
#[test]
fn weak_observes_full_lifecycle() {
    let drops = RefCell::new(0);

    let s1 = Strong::new(DropProbe(&drops));
    assert_eq!(Strong::strong_count(&s1), 1);

    let w = Strong::downgrade(&s1);
    assert_eq!(Strong::weak_count(&s1), 1);

    let s2 = w.upgrade().unwrap();
    assert_eq!(Strong::strong_count(&s1), 2);
    assert!(Strong::ptr_eq(&s1, &s2));

    drop(s1);
    assert_eq!(*drops.borrow(), 0);
    assert_eq!(Strong::strong_count(&s2), 1);

    drop(s2);
    assert_eq!(*drops.borrow(), 1);

    assert!(w.upgrade().is_none());
    drop(w);
}

#[test]
fn block_freed_once_after_both_sides_release() {
    static ALLOCS: AtomicUsize = AtomicUsize::new(0);
    static FREES: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy, Debug, Default)]
    struct CountingAllocator;

    impl BlockAllocator for CountingAllocator {
        fn allocate(&self, layout: Layout) -> NonNull<u8> {
            ALLOCS.fetch_add(1, Relaxed);
            SystemAllocator.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            FREES.fetch_add(1, Relaxed);
            // Safety: forwarded from the caller's contract.
            unsafe { SystemAllocator.deallocate(ptr, layout) }
        }
    }

    let drops = RefCell::new(0);
    let strong = Strong::new_in(DropProbe(&drops), CountingAllocator);
    assert_eq!(ALLOCS.load(Relaxed), 1);

    let weak = Strong::downgrade(&strong);
    drop(strong);
    // The value is destroyed, but the weak handle keeps the block.
    assert_eq!(*drops.borrow(), 1);
    assert_eq!(FREES.load(Relaxed), 0);
    assert!(weak.upgrade().is_none());

    drop(weak);
    assert_eq!(ALLOCS.load(Relaxed), 1);
    assert_eq!(FREES.load(Relaxed), 1);
}

#[test]
fn transfer_is_count_free_and_atomic_free() {
    let mut a = Strong::new(0u32);
    let before = ops::observed();

    let b = Strong::take(&mut a);
    assert!(Strong::is_empty(&a));
    assert_eq!(Strong::strong_count(&b), 1);
    assert_eq!(ops::observed(), before, "transfer must not touch the counts");

    let c = b.clone();
    drop(c);
    assert_eq!(Strong::strong_count(&b), 1);
    assert_eq!(
        ops::observed() - before,
        2,
        "clone-then-drop pays two atomic operations for a net-zero change"
    );
}

fn store_moving(handle: Strong<u32>, slot: &mut Strong<u32>) {
    *slot = handle;
}

fn store_copying(handle: Strong<u32>, slot: &mut Strong<u32>) {
    *slot = handle.clone();
}

#[test]
fn storing_by_transfer_beats_copy_then_drop() {
    let origin = Strong::new(9u32);

    // Receiving by value and moving into the slot: only the increment
    // that produced the by-value argument.
    let mut slot = Strong::empty();
    let before = ops::observed();
    store_moving(origin.clone(), &mut slot);
    assert_eq!(ops::observed() - before, 1);

    // Copying into the slot and dropping the argument wastes two more.
    let mut slot = Strong::empty();
    let before = ops::observed();
    store_copying(origin.clone(), &mut slot);
    assert_eq!(ops::observed() - before, 3);

    assert_eq!(Strong::strong_count(&origin), 3);
}

#[test]
fn unique_access() {
    let mut x = Strong::new(3);
    *Strong::get_mut(&mut x).unwrap() = 4;
    assert_eq!(*x, 4);

    let y = x.clone();
    assert!(Strong::get_mut(&mut x).is_none());
    drop(y);

    let w = Strong::downgrade(&x);
    assert!(Strong::get_mut(&mut x).is_none());
    drop(w);
    assert!(Strong::get_mut(&mut x).is_some());
}

#[test]
fn raw_round_trip() {
    let x = Strong::new("hello".to_owned());
    let ptr = Strong::into_raw(x);
    // Safety: the pointer came from `into_raw` and is restored exactly
    // once.
    let x = unsafe { Strong::from_raw(ptr) };
    assert_eq!(&*x, "hello");
    assert_eq!(Strong::strong_count(&x), 1);

    let empty = Strong::<i32>::empty();
    let ptr = Strong::into_raw(empty);
    assert!(ptr.is_null());
    // Safety: a null pointer restores to an empty handle.
    let empty = unsafe { Strong::from_raw(ptr) };
    assert!(Strong::is_empty(&empty));
}

#[test]
fn value_comparisons() {
    let one = Strong::new(1);
    let two = Strong::new(2);
    assert!(one < two);
    assert_eq!(one, Strong::new(1));
    // Empty handles order before populated ones and equal each other.
    assert!(Strong::<i32>::empty() < one);
    assert_eq!(Strong::<i32>::empty(), Strong::empty());
}

#[test]
fn destructor_runs_exactly_once_across_threads() {
    let drops = AtomicUsize::new(0);
    let origin = Strong::new(AtomicProbe(&drops));

    thread::scope(|s| {
        for _ in 0..8 {
            let handle = origin.clone();
            s.spawn(move || {
                let extra = handle.clone();
                drop(handle);
                drop(extra);
            });
        }
    });

    assert_eq!(drops.load(Relaxed), 0);
    drop(origin);
    assert_eq!(drops.load(Relaxed), 1);
}

#[test]
fn upgrade_races_with_last_release() {
    for round in 0..200 {
        let strong = Strong::new(round);
        let weak = Strong::downgrade(&strong);

        thread::scope(|s| {
            let dropper = s.spawn(move || drop(strong));
            let upgrader = s.spawn(move || weak.upgrade().map(|h| *h));

            dropper.join().unwrap();
            // Either the upgrade lost the race (the value is gone) or
            // it won and observed the intact value.
            if let Some(v) = upgrader.join().unwrap() {
                assert_eq!(v, round);
            }
        });
    }
}

#[test]
fn randomized_clone_drop_storm() {
    let drops = AtomicUsize::new(0);
    let origin = Strong::new(AtomicProbe(&drops));
    let weak = Strong::downgrade(&origin);

    thread::scope(|s| {
        for t in 0..4u64 {
            let local = origin.clone();
            let weak = weak.clone();
            s.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(0xC0FFEE ^ t);
                let mut extras = Vec::new();
                for _ in 0..1_000 {
                    match rng.gen_range(0..4) {
                        0 => extras.push(local.clone()),
                        1 => {
                            extras.pop();
                        }
                        2 => {
                            // The origin outlives the scope, so the
                            // promotion can never fail here.
                            extras.push(weak.upgrade().unwrap());
                        }
                        _ => {
                            if let Some(mut handle) = extras.pop() {
                                let moved = Strong::take(&mut handle);
                                assert!(Strong::is_empty(&handle));
                                extras.push(moved);
                            }
                        }
                    }
                }
            });
        }
    });

    assert_eq!(drops.load(Relaxed), 0);
    drop(weak);
    drop(origin);
    assert_eq!(drops.load(Relaxed), 1);
}
