//! Self-reference capability for managed types.
//!
//! A type opts in by embedding a [`SelfRef`] field and implementing
//! [`SelfReferential`]. Handles to such a type are constructed through
//! [`Strong::new_bound`], which stores a weak handle back into the new
//! value before the constructor returns; from then on the value can
//! mint new strong handles to itself from inside its own methods via
//! [`SelfReferential::acquire_self`].
//!
//! `acquire_self` has two designed failure paths, both reported as
//! [`None`] rather than a crash: before any strong handle exists over
//! the value (for example from inside the value's own constructor,
//! which necessarily runs before the control block is created), and
//! after the last strong handle has released the value (for example
//! from inside its destructor).
//!
//! A value with this capability must only ever be destroyed through
//! the handle types, never by hand, while any handle to it exists.
//!
//! Self-references are one step away from reference cycles: a cycle of
//! strong handles is never collected. Any "back" relation must
//! therefore be typed [`Weak`]:
//!
//! ```
//! use tether::{Strong, Weak};
//!
//! struct Parent {
//!     children: Vec<Strong<Child>>,
//! }
//!
//! struct Child {
//!     parent: Weak<Parent>, // never `Strong<Parent>`
//! }
//! ```

use crate::allocator::{BlockAllocator, SystemAllocator};
use crate::handle::{Strong, Weak};
use std::fmt::{Debug, Formatter};
use std::sync::OnceLock;

/// The internally stored weak handle backing [`SelfReferential`].
///
/// Starts out unbound; [`Strong::new_bound`] binds it exactly once, at
/// the moment the first strong handle over the value is constructed.
pub struct SelfRef<T, A: BlockAllocator = SystemAllocator> {
    cell: OnceLock<Weak<T, A>>,
}

impl<T, A: BlockAllocator> SelfRef<T, A> {
    /// Constructs an unbound `SelfRef`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Returns whether a control block has been bound yet.
    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Promotes the stored weak handle into a strong one.
    ///
    /// Returns [`None`] while unbound or once the value has been
    /// released.
    pub fn acquire(&self) -> Option<Strong<T, A>>
    where
        A: Clone,
    {
        self.cell.get()?.upgrade()
    }

    /// Binds the control block. Only the first call has an effect.
    pub(crate) fn bind(&self, weak: Weak<T, A>) {
        let _ = self.cell.set(weak);
    }
}

impl<T, A: BlockAllocator> Default for SelfRef<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: BlockAllocator> Debug for SelfRef<T, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_bound() {
            f.write_str("SelfRef(bound)")
        } else {
            f.write_str("SelfRef(unbound)")
        }
    }
}

/// Capability of a managed type to hand out strong handles to itself.
///
/// Implementors embed a [`SelfRef`] field and return it from
/// [`self_ref`](SelfReferential::self_ref); everything else is
/// provided.
///
/// # Examples
///
/// ```
/// use tether::{SelfRef, SelfReferential, Strong};
///
/// struct Node {
///     label: &'static str,
///     self_ref: SelfRef<Node>,
/// }
///
/// impl SelfReferential for Node {
///     fn self_ref(&self) -> &SelfRef<Node> {
///         &self.self_ref
///     }
/// }
///
/// impl Node {
///     /// Hands a co-owning handle to some long-lived consumer.
///     fn subscribe(&self) -> Strong<Node> {
///         self.acquire_self().expect("node is owned by a strong handle")
///     }
/// }
///
/// let node = Strong::new_bound(Node {
///     label: "n1",
///     self_ref: SelfRef::new(),
/// });
///
/// let subscription = node.subscribe();
/// assert!(Strong::ptr_eq(&node, &subscription));
/// assert_eq!(Strong::strong_count(&node), 2);
/// ```
pub trait SelfReferential<A: BlockAllocator = SystemAllocator>: Sized {
    /// Returns the embedded [`SelfRef`] field.
    fn self_ref(&self) -> &SelfRef<Self, A>;

    /// Mints a new strong handle to `self`.
    ///
    /// Returns [`None`] before any strong handle exists over the value
    /// and after the last one released it.
    fn acquire_self(&self) -> Option<Strong<Self, A>>
    where
        A: Clone,
    {
        self.self_ref().acquire()
    }
}

impl<T: SelfReferential> Strong<T> {
    /// Constructs a new `Strong` and binds the value's [`SelfRef`] to
    /// the freshly created control block.
    ///
    /// This is the construction entry point for types with the
    /// self-reference capability; constructing them via
    /// [`Strong::new`] instead leaves [`acquire_self`] permanently
    /// failing.
    ///
    /// [`acquire_self`]: SelfReferential::acquire_self
    pub fn new_bound(data: T) -> Strong<T> {
        Strong::new_bound_in(data, SystemAllocator)
    }
}

impl<T: SelfReferential<A>, A: BlockAllocator + Clone> Strong<T, A> {
    /// Constructs a new `Strong` with the provided allocator and binds
    /// the value's [`SelfRef`] to the new control block.
    pub fn new_bound_in(data: T, alloc: A) -> Strong<T, A> {
        let strong = Strong::new_in(data, alloc);
        strong.self_ref().bind(Strong::downgrade(&strong));
        strong
    }
}
