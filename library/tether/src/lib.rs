//! Shared-ownership reference-counted handles.
//!
//! The crate provides one primitive: a managed value lives in a heap
//! control block together with a strong and a weak reference count.
//! [`Strong`] handles own the value and keep it alive, [`Weak`] handles
//! observe the block and may be promoted back into strong handles while
//! the value still exists, and types opting into [`SelfReferential`]
//! can mint new strong handles to themselves from inside their own
//! methods.
//!
//! Ownership is deterministic: the value is destroyed synchronously by
//! whichever handle releases the last strong reference, and the block
//! is freed by whichever handle releases the last reference of either
//! kind. All count management is lock-free.
//!
//! # Examples
//!
//! ```
//! use tether::Strong;
//!
//! let strong = Strong::new(5);
//! let weak = Strong::downgrade(&strong);
//!
//! let also_strong = weak.upgrade().unwrap();
//! assert_eq!(*also_strong, 5);
//!
//! drop(strong);
//! drop(also_strong);
//! assert!(weak.upgrade().is_none());
//! ```
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

pub mod allocator;
pub mod handle;
pub mod refcount;
pub mod self_ref;

pub use allocator::{BlockAllocator, SystemAllocator};
pub use handle::{Strong, Weak};
pub use refcount::RefCount;
pub use self_ref::{SelfRef, SelfReferential};
