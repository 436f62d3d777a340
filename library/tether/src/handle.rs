//! Strong and weak handles over a shared control block.
//!
//! A [`Strong`] handle owns the managed value: as long as one exists
//! the value is alive. A [`Weak`] handle observes the control block
//! without owning the value and can be promoted back into a strong
//! handle via [`Weak::upgrade`] while the value still exists.
//!
//! Both handle types have an *empty* state holding no block reference,
//! which is what [`Strong::take`] leaves behind: moving ownership out
//! of a slot touches no reference count at all, whereas cloning and
//! dropping each cost one atomic operation.
//!
//! Reference cycles are not detected. A "back" relation (child to
//! parent, observer to subject) must be typed [`Weak`], never
//! [`Strong`], otherwise the cycle keeps every participant alive
//! forever.

use crate::allocator::{BlockAllocator, SystemAllocator};
use crate::refcount::RefCount;
use std::alloc::Layout;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter, Pointer};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::ptr::{addr_of, NonNull};

#[cfg(test)]
mod test;

/// One control block: the counts followed by the managed value.
///
/// The block is allocated when the first strong handle is constructed
/// and freed when both counts have independently reached zero. The
/// value is dropped in place on the last strong release; the block
/// itself may outlive it while weak handles remain.
#[repr(C)]
struct HandleInner<T> {
    counts: RefCount,
    data: ManuallyDrop<T>,
}

/// Byte offset of the data field inside a control block.
fn data_offset<T>() -> usize {
    let (_, offset) = Layout::new::<RefCount>()
        .extend(Layout::new::<ManuallyDrop<T>>())
        .expect("control block layout overflow");
    offset
}

/// An owning, reference-counted handle to a heap-managed value.
///
/// Cloning increments the strong count with a single atomic operation;
/// moving a handle (or [`Strong::take`]) transfers ownership without
/// touching any count. The value is destroyed, synchronously and
/// exactly once, by whichever handle releases the last strong
/// reference.
///
/// A default-constructed handle is *empty*: it references no control
/// block, and dereferencing it panics.
///
/// # Examples
///
/// ```
/// use tether::Strong;
///
/// let five = Strong::new(5);
/// let same_five = five.clone();
/// assert_eq!(Strong::strong_count(&five), 2);
/// assert!(Strong::ptr_eq(&five, &same_five));
/// ```
pub struct Strong<T, A: BlockAllocator = SystemAllocator> {
    ptr: Option<NonNull<HandleInner<T>>>,
    phantom: PhantomData<HandleInner<T>>,
    alloc: A,
}

impl<T> Strong<T> {
    /// Constructs a new `Strong` owning the provided value.
    ///
    /// Allocates one control block with a strong count of one.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let five = Strong::new(5);
    /// assert_eq!(*five, 5);
    /// ```
    #[inline]
    pub fn new(data: T) -> Strong<T> {
        Strong::new_in(data, SystemAllocator)
    }

    /// Constructs an empty `Strong` without allocating.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let empty = Strong::<i32>::empty();
    /// assert!(Strong::is_empty(&empty));
    /// ```
    #[inline]
    #[must_use]
    pub fn empty() -> Strong<T> {
        Strong::empty_in(SystemAllocator)
    }

    /// Constructs a `Strong` from a raw pointer previously returned by
    /// [`Strong::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `into_raw`, and the strong
    /// reference it represents must not have been reclaimed yet.
    /// Calling this more than once for the same `into_raw` result
    /// creates independent handles that each believe they own one unit
    /// of the strong count, leading to double destruction. This is the
    /// only entry point through which that misuse is expressible.
    #[inline]
    pub unsafe fn from_raw(ptr: *const T) -> Strong<T> {
        // Safety: forwarded from the caller.
        unsafe { Strong::from_raw_in(ptr, SystemAllocator) }
    }
}

impl<T, A: BlockAllocator> Strong<T, A> {
    /// Constructs a new `Strong` using the provided block allocator.
    #[inline]
    pub fn new_in(data: T, alloc: A) -> Strong<T, A> {
        let layout = Layout::new::<HandleInner<T>>();
        let block = alloc.allocate(layout).cast::<HandleInner<T>>();

        // Safety: freshly allocated and correctly aligned for
        // `HandleInner<T>`.
        unsafe {
            block.as_ptr().write(HandleInner {
                counts: RefCount::new(),
                data: ManuallyDrop::new(data),
            });
        }

        Strong {
            ptr: Some(block),
            phantom: PhantomData,
            alloc,
        }
    }

    /// Constructs an empty `Strong` carrying the provided allocator.
    #[inline]
    #[must_use]
    pub fn empty_in(alloc: A) -> Strong<T, A> {
        Strong {
            ptr: None,
            phantom: PhantomData,
            alloc,
        }
    }

    /// Constructs a `Strong` from a raw pointer and an allocator.
    ///
    /// # Safety
    ///
    /// Same contract as [`Strong::from_raw`]; additionally `alloc` must
    /// be the allocator the block was allocated with.
    #[inline]
    pub unsafe fn from_raw_in(ptr: *const T, alloc: A) -> Strong<T, A> {
        if ptr.is_null() {
            return Strong::empty_in(alloc);
        }

        // Safety: per the caller's contract, `ptr` points at the data
        // field of a live control block; walking back by the field
        // offset recovers the block itself.
        let block = unsafe { ptr.cast::<u8>().cast_mut().sub(data_offset::<T>()) }
            .cast::<HandleInner<T>>();

        Strong {
            // Safety: derived from a non-null pointer.
            ptr: Some(unsafe { NonNull::new_unchecked(block) }),
            phantom: PhantomData,
            alloc,
        }
    }

    /// Consumes the handle, returning the wrapped pointer.
    ///
    /// Returns a null pointer for an empty handle. The strong reference
    /// is leaked until the pointer is passed back to
    /// [`Strong::from_raw`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let x = Strong::new("hello".to_owned());
    /// let ptr = Strong::into_raw(x);
    /// assert_eq!(unsafe { &*ptr }, "hello");
    ///
    /// // Convert back to prevent the leak.
    /// let _x = unsafe { Strong::from_raw(ptr) };
    /// ```
    #[inline]
    pub fn into_raw(this: Self) -> *const T {
        let this = ManuallyDrop::new(this);
        match this.ptr {
            // Safety: the handle is non-empty, so the block is alive.
            Some(block) => unsafe { addr_of!((*block.as_ptr()).data) }.cast::<T>(),
            None => std::ptr::null(),
        }
    }

    /// Consumes the handle, returning the wrapped pointer and the
    /// allocator.
    #[inline]
    pub fn into_raw_parts(this: Self) -> (*const T, A) {
        let this = ManuallyDrop::new(this);
        // Safety: `this` is never dropped, so the allocator is moved
        // out exactly once.
        let alloc = unsafe { std::ptr::read(&this.alloc) };
        let ptr = match this.ptr {
            // Safety: the handle is non-empty, so the block is alive.
            Some(block) => unsafe { addr_of!((*block.as_ptr()).data) }.cast::<T>(),
            None => std::ptr::null(),
        };
        (ptr, alloc)
    }

    /// Returns whether the handle references no control block.
    #[inline]
    pub fn is_empty(this: &Self) -> bool {
        this.ptr.is_none()
    }

    /// Returns a reference to the managed value, or [`None`] for an
    /// empty handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let x = Strong::new(3);
    /// assert_eq!(Strong::get(&x), Some(&3));
    /// assert_eq!(Strong::get(&Strong::<i32>::empty()), None);
    /// ```
    #[inline]
    pub fn get(this: &Self) -> Option<&T> {
        this.inner().map(|inner| &*inner.data)
    }

    /// Provides a raw pointer to the managed value, or null for an
    /// empty handle.
    #[inline]
    #[must_use]
    pub fn as_ptr(this: &Self) -> *const T {
        match this.ptr {
            // Safety: the handle is non-empty, so the block is alive.
            Some(block) => unsafe { addr_of!((*block.as_ptr()).data) }.cast::<T>(),
            None => std::ptr::null(),
        }
    }

    /// Returns a reference to the underlying allocator.
    #[inline]
    pub fn allocator(this: &Self) -> &A {
        &this.alloc
    }

    /// Moves ownership out of `this`, leaving it empty.
    ///
    /// The transfer touches no reference count: the returned handle
    /// takes over the unit of the strong count that `this` held. This
    /// is the preferred way to pass ownership onward, as a
    /// clone-then-drop of the source costs two atomic operations for
    /// the same net effect.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let mut a = Strong::new(5);
    /// let b = Strong::take(&mut a);
    /// assert!(Strong::is_empty(&a));
    /// assert_eq!(*b, 5);
    /// assert_eq!(Strong::strong_count(&b), 1);
    /// ```
    #[inline]
    pub fn take(this: &mut Self) -> Strong<T, A>
    where
        A: Clone,
    {
        Strong {
            ptr: this.ptr.take(),
            phantom: PhantomData,
            alloc: this.alloc.clone(),
        }
    }

    /// Releases the handle's strong reference, leaving it empty.
    ///
    /// If this was the last strong reference the managed value is
    /// destroyed before the call returns. Releasing an empty handle is
    /// a no-op.
    #[inline]
    pub fn release(this: &mut Self) {
        let Some(block) = this.ptr.take() else {
            return;
        };

        // Safety: this handle owned one unit of the strong count.
        if unsafe { block.as_ref().counts.decrease_strong() } {
            // Safety: this call performed the 1 -> 0 transition.
            unsafe { this.drop_slow(block) };
        }
    }

    /// Creates a new [`Weak`] handle to this allocation.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let five = Strong::new(5);
    /// let weak_five = Strong::downgrade(&five);
    /// assert_eq!(weak_five.upgrade().as_deref(), Some(&5));
    /// ```
    #[inline]
    pub fn downgrade(this: &Self) -> Weak<T, A>
    where
        A: Clone,
    {
        if let Some(inner) = this.inner() {
            // Safety: this handle's strong reference pins the block.
            unsafe { inner.counts.increase_weak() };
        }

        Weak {
            ptr: this.ptr,
            alloc: this.alloc.clone(),
        }
    }

    /// Gets the number of strong handles to this allocation, or zero
    /// for an empty handle.
    #[inline]
    pub fn strong_count(this: &Self) -> usize {
        this.inner().map_or(0, |inner| inner.counts.strong_count())
    }

    /// Gets the number of [`Weak`] handles to this allocation.
    #[inline]
    pub fn weak_count(this: &Self) -> usize {
        this.inner().map_or(0, |inner| inner.counts.weak_count())
    }

    /// Returns whether the two handles reference the same control
    /// block. Two empty handles compare equal.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let five = Strong::new(5);
    /// let same_five = five.clone();
    /// let other_five = Strong::new(5);
    ///
    /// assert!(Strong::ptr_eq(&five, &same_five));
    /// assert!(!Strong::ptr_eq(&five, &other_five));
    /// ```
    #[inline]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Returns a mutable reference to the managed value if `this` is
    /// the only handle (strong or weak) to it, and [`None`] otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let mut x = Strong::new(3);
    /// *Strong::get_mut(&mut x).unwrap() = 4;
    /// assert_eq!(*x, 4);
    ///
    /// let _y = x.clone();
    /// assert!(Strong::get_mut(&mut x).is_none());
    /// ```
    #[inline]
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let block = this.ptr?;

        // Safety: the handle is non-empty, so the block is alive.
        if unsafe { block.as_ref() }.counts.is_unique() {
            // Safety: this is the sole reference of either kind, so no
            // aliasing access to the value can exist.
            Some(unsafe { &mut *(*block.as_ptr()).data })
        } else {
            None
        }
    }

    #[inline]
    fn inner(&self) -> Option<&HandleInner<T>> {
        // Safety: while the handle is non-empty its strong reference
        // keeps the block alive, and the block is shareable because all
        // count mutation is atomic.
        self.ptr.map(|block| unsafe { block.as_ref() })
    }

    /// Destroys the value and gives up the strong side's weak unit.
    #[inline(never)]
    unsafe fn drop_slow(&mut self, block: NonNull<HandleInner<T>>) {
        // Safety: the caller performed the last strong release, so no
        // other handle can reach the value anymore.
        unsafe { ManuallyDrop::drop(&mut (*block.as_ptr()).data) };

        // Safety: the weak unit held collectively by the strong
        // handles is still counted; give it up.
        if unsafe { block.as_ref().counts.decrease_weak() } {
            // Safety: both counts reached zero and the block is
            // unreachable; it was allocated with this layout.
            unsafe {
                self.alloc
                    .deallocate(block.cast(), Layout::new::<HandleInner<T>>());
            }
        }
    }
}

// Safety: sending a handle between threads hands out access to the
// shared value from the new thread (requires `T: Sync` through clones
// and `T: Send` for the final drop). Count mutation itself is atomic.
unsafe impl<T: Send + Sync, A: BlockAllocator + Send> Send for Strong<T, A> {}

// Safety: `&Strong` exposes `&T` on any thread and allows cloning a
// `Send`-able handle, so the same bounds as for `Send` apply.
unsafe impl<T: Send + Sync, A: BlockAllocator + Sync> Sync for Strong<T, A> {}

impl<T: RefUnwindSafe, A: BlockAllocator + UnwindSafe> UnwindSafe for Strong<T, A> {}

impl<T, A: BlockAllocator + Clone> Clone for Strong<T, A> {
    /// Makes another owning handle to the same value.
    ///
    /// Costs one atomic increment; cloning an empty handle is free and
    /// yields an empty handle.
    #[inline]
    fn clone(&self) -> Self {
        if let Some(inner) = self.inner() {
            // Safety: this handle's strong reference guarantees the
            // count is at least one.
            unsafe { inner.counts.increase_strong() };
        }

        Strong {
            ptr: self.ptr,
            phantom: PhantomData,
            alloc: self.alloc.clone(),
        }
    }
}

impl<T, A: BlockAllocator> Drop for Strong<T, A> {
    #[inline]
    fn drop(&mut self) {
        Strong::release(self);
    }
}

impl<T, A: BlockAllocator> Deref for Strong<T, A> {
    type Target = T;

    /// Dereferences the managed value.
    ///
    /// # Panics
    ///
    /// Panics when the handle is empty; use [`Strong::get`] to branch
    /// instead.
    #[inline]
    fn deref(&self) -> &T {
        match self.inner() {
            Some(inner) => &*inner.data,
            None => panic!("dereferenced an empty strong handle"),
        }
    }
}

impl<T, A: BlockAllocator> AsRef<T> for Strong<T, A> {
    #[inline]
    fn as_ref(&self) -> &T {
        &**self
    }
}

impl<T, A: BlockAllocator> Borrow<T> for Strong<T, A> {
    #[inline]
    fn borrow(&self) -> &T {
        &**self
    }
}

impl<T, A: BlockAllocator + Default> Default for Strong<T, A> {
    /// Constructs an empty handle.
    #[inline]
    fn default() -> Self {
        Strong::empty_in(A::default())
    }
}

impl<T> From<T> for Strong<T> {
    #[inline]
    fn from(data: T) -> Self {
        Strong::new(data)
    }
}

impl<T: Debug, A: BlockAllocator> Debug for Strong<T, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match Strong::get(self) {
            Some(data) => Debug::fmt(data, f),
            None => f.write_str("(empty)"),
        }
    }
}

impl<T: Display, A: BlockAllocator> Display for Strong<T, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match Strong::get(self) {
            Some(data) => Display::fmt(data, f),
            None => f.write_str("(empty)"),
        }
    }
}

impl<T, A: BlockAllocator> Pointer for Strong<T, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Pointer::fmt(&Strong::as_ptr(self), f)
    }
}

impl<T: Hash, A: BlockAllocator> Hash for Strong<T, A> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        Strong::get(self).hash(state);
    }
}

impl<T: PartialEq, A: BlockAllocator> PartialEq for Strong<T, A> {
    /// Compares the managed values; two empty handles are equal and an
    /// empty handle never equals a populated one.
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Strong::get(self) == Strong::get(other)
    }
}

impl<T: Eq, A: BlockAllocator> Eq for Strong<T, A> {}

impl<T: PartialOrd, A: BlockAllocator> PartialOrd for Strong<T, A> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Strong::get(self).partial_cmp(&Strong::get(other))
    }
}

impl<T: Ord, A: BlockAllocator> Ord for Strong<T, A> {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        Strong::get(self).cmp(&Strong::get(other))
    }
}

/// A non-owning handle to a value managed by [`Strong`] handles.
///
/// A `Weak` does not keep the value alive and never grants direct
/// access to it; it must be promoted with [`Weak::upgrade`] first.
/// Promotion fails, as a normal outcome, once the last strong handle
/// has released the value.
///
/// # Examples
///
/// ```
/// use tether::{Strong, Weak};
///
/// let strong = Strong::new("alive");
/// let weak = Strong::downgrade(&strong);
/// assert!(weak.upgrade().is_some());
///
/// drop(strong);
/// assert!(weak.upgrade().is_none());
/// ```
pub struct Weak<T, A: BlockAllocator = SystemAllocator> {
    ptr: Option<NonNull<HandleInner<T>>>,
    alloc: A,
}

impl<T> Weak<T> {
    /// Constructs an empty `Weak` without allocating.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Weak;
    ///
    /// let empty: Weak<i64> = Weak::new();
    /// assert!(empty.upgrade().is_none());
    /// ```
    #[must_use]
    pub fn new() -> Weak<T> {
        Weak::new_in(SystemAllocator)
    }
}

impl<T, A: BlockAllocator> Weak<T, A> {
    /// Constructs an empty `Weak` carrying the provided allocator.
    #[must_use]
    pub fn new_in(alloc: A) -> Weak<T, A> {
        Weak { ptr: None, alloc }
    }

    /// Attempts to promote the weak handle into a [`Strong`] one.
    ///
    /// Succeeds, incrementing the strong count, only while the value is
    /// still owned by at least one strong handle. Returns [`None`] once
    /// the value has been released; the caller must branch on that
    /// outcome. Never blocks and never panics.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether::Strong;
    ///
    /// let five = Strong::new(5);
    /// let weak_five = Strong::downgrade(&five);
    ///
    /// let strong_five = weak_five.upgrade();
    /// assert!(strong_five.is_some());
    ///
    /// drop(strong_five);
    /// drop(five);
    /// assert!(weak_five.upgrade().is_none());
    /// ```
    pub fn upgrade(&self) -> Option<Strong<T, A>>
    where
        A: Clone,
    {
        let block = self.ptr?;

        // Safety: this handle's weak reference keeps the block alive.
        if unsafe { block.as_ref().counts.upgrade_strong() } {
            Some(Strong {
                ptr: Some(block),
                phantom: PhantomData,
                alloc: self.alloc.clone(),
            })
        } else {
            None
        }
    }

    /// Moves the weak reference out of `this`, leaving it empty,
    /// without touching any count.
    pub fn take(this: &mut Self) -> Weak<T, A>
    where
        A: Clone,
    {
        Weak {
            ptr: this.ptr.take(),
            alloc: this.alloc.clone(),
        }
    }

    /// Returns whether the handle references no control block.
    pub fn is_empty(this: &Self) -> bool {
        this.ptr.is_none()
    }

    /// Gets the number of strong handles to this allocation.
    pub fn strong_count(&self) -> usize {
        self.inner().map_or(0, |inner| inner.counts.strong_count())
    }

    /// Gets the number of weak handles to this allocation, or zero for
    /// an empty handle.
    pub fn weak_count(&self) -> usize {
        self.inner().map_or(0, |inner| inner.counts.weak_count())
    }

    /// Returns whether the two handles reference the same control
    /// block. Two empty handles compare equal.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Returns a reference to the underlying allocator.
    pub fn allocator(this: &Self) -> &A {
        &this.alloc
    }

    fn inner(&self) -> Option<&HandleInner<T>> {
        // Safety: while the handle is non-empty its weak reference
        // keeps the block (not the value) alive.
        self.ptr.map(|block| unsafe { block.as_ref() })
    }
}

// Safety: a weak handle can be upgraded on the receiving thread, which
// hands out access to the shared value; same bounds as `Strong`.
unsafe impl<T: Send + Sync, A: BlockAllocator + Send> Send for Weak<T, A> {}

// Safety: see the `Send` impl.
unsafe impl<T: Send + Sync, A: BlockAllocator + Sync> Sync for Weak<T, A> {}

impl<T, A: BlockAllocator + Clone> Clone for Weak<T, A> {
    /// Makes another weak handle to the same block, incrementing the
    /// weak count.
    fn clone(&self) -> Self {
        if let Some(inner) = self.inner() {
            // Safety: this handle owns a weak reference.
            unsafe { inner.counts.increase_weak() };
        }

        Weak {
            ptr: self.ptr,
            alloc: self.alloc.clone(),
        }
    }
}

impl<T, A: BlockAllocator> Drop for Weak<T, A> {
    fn drop(&mut self) {
        let Some(block) = self.ptr.take() else {
            return;
        };

        // Safety: this handle owned one unit of the weak count.
        if unsafe { block.as_ref().counts.decrease_weak() } {
            // Safety: both counts reached zero; the value was already
            // destroyed by the last strong release, and nobody else can
            // reach the block.
            unsafe {
                self.alloc
                    .deallocate(block.cast(), Layout::new::<HandleInner<T>>());
            }
        }
    }
}

impl<T, A: BlockAllocator + Default> Default for Weak<T, A> {
    fn default() -> Self {
        Weak::new_in(A::default())
    }
}

impl<T, A: BlockAllocator> Debug for Weak<T, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("(Weak)")
    }
}

static_assertions::assert_impl_all!(Strong<i32>: Send, Sync);
static_assertions::assert_impl_all!(Weak<i32>: Send, Sync);
static_assertions::assert_not_impl_any!(Strong<std::cell::Cell<i32>>: Send, Sync);
static_assertions::assert_not_impl_any!(Weak<std::cell::Cell<i32>>: Send, Sync);
