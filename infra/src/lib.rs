#![cfg_attr(not(test), no_std)]

//! Data-structure primitives shared by the kernel core.
//!
//! Everything here is intrusive: a [`list::ListNode`] is meant to be
//! embedded as a field inside a larger kernel object (a thread control
//! block, a timer, a wait descriptor) rather than to own that object. The
//! kernel allocates those larger objects from its own heap, not from the
//! Rust global allocator, so the lists in this crate never call `alloc`
//! and never take ownership of what they link.

pub mod list;

/// Recovers a pointer to the struct containing `$field` from a pointer to
/// that field, by subtracting the field's compile-time offset.
///
/// # Safety
/// `$ptr` must actually point at the `$field` member of a live `$type`.
#[macro_export]
macro_rules! container_of {
    ($ptr:expr, $type:path, $field:ident) => {
        $ptr.cast::<u8>()
            .sub(core::mem::offset_of!($type, $field))
            .cast::<$type>()
    };
}
