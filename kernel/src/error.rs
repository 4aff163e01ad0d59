//! Error reporting conventions.
//!
//! There is no exception-like control flow here: out-of-memory is a null
//! pointer, timeout is `false`, and a violated precondition (unlocking a
//! mutex you don't own, freeing an unrecognized pointer, blocking from
//! interrupt context) is a programmer error caught by a debug assertion
//! and undefined in release builds, same as the rest of this kernel's
//! unsafe surface.

/// Asserts the calling context is not inside an ISR. Compiled out entirely
/// when debug assertions are off, matching the release-mode-undefined
/// policy for precondition violations.
#[macro_export]
macro_rules! debug_assert_not_in_interrupt {
    ($critical:expr) => {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            $critical.irq_nesting(),
            0,
            "operation not permitted from interrupt context"
        );
    };
}
