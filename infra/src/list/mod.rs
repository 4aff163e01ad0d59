//! Intrusive doubly linked circular lists.
//!
//! Two flavors share the same node layout:
//! - [`ListNode`] used directly through the plain insert/remove functions
//!   behaves as an unordered, FIFO-on-push_back list.
//! - [`insert_by_key`] threads the same node type onto a list kept sorted
//!   ascending by an externally supplied key, with new entries placed
//!   after existing entries of equal key (FIFO among ties).
//!
//! A node that isn't linked into anything points at itself; this is the
//! "detached" state and is also what a freshly created node starts in, and
//! what a list head itself looks like when the list is empty.

mod node;

pub use node::{
    insert_after, insert_before, insert_by_key, is_empty, pop_back, pop_front, remove, ListNode,
};
