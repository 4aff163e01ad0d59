//! Nestable critical sections: the kernel's sole mutual-exclusion
//! mechanism. A critical section masks interrupts and counts how many
//! times it has been entered so nested callers don't re-enable
//! interrupts out from under an outer caller.

use core::cell::Cell;
use core::marker::PhantomData;
use rtos_arch::Port;

/// Per-kernel-instance nesting counter plus an ISR-nesting counter used to
/// reject operations (like blocking) that are illegal from interrupt
/// context. Neither counter is `Sync` in the type-system sense; soundness
/// relies on single-CPU execution and on every access happening either
/// with interrupts already disabled or from a held [`Guard`].
pub struct State {
    nesting: Cell<u32>,
    irq_nesting: Cell<u32>,
    saved_level: Cell<usize>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            nesting: Cell::new(0),
            irq_nesting: Cell::new(0),
            saved_level: Cell::new(0),
        }
    }

    pub fn nesting(&self) -> u32 {
        self.nesting.get()
    }

    pub fn irq_nesting(&self) -> u32 {
        self.irq_nesting.get()
    }

    /// Called by the port's interrupt dispatch trampoline on entry to any
    /// ISR, including the tick handler, before it touches kernel state.
    pub fn enter_isr(&self) {
        self.irq_nesting.set(self.irq_nesting.get() + 1);
    }

    /// Called by the port's interrupt dispatch trampoline just before
    /// returning from an ISR.
    pub fn exit_isr(&self) {
        self.irq_nesting.set(self.irq_nesting.get() - 1);
    }

    /// Disables interrupts and increments the nesting count. Returns the
    /// nesting depth *before* this call, i.e. `0` means this call is the
    /// one that actually masked interrupts.
    fn enter<P: Port>(&self) -> u32 {
        let depth = self.nesting.get();
        if depth == 0 {
            let level = P::disable_interrupts();
            self.saved_level.set(level);
        }
        self.nesting.set(depth + 1);
        depth
    }

    /// Decrements the nesting count, re-enabling interrupts once it
    /// reaches zero. A no-op if already at zero (mirrors the reference
    /// implementation's tolerance of unbalanced exits rather than
    /// panicking in a context where panicking is itself unsafe).
    fn exit<P: Port>(&self) {
        let depth = self.nesting.get();
        if depth == 0 {
            return;
        }
        if depth == 1 {
            self.nesting.set(0);
            P::enable_interrupts(self.saved_level.get());
        } else {
            self.nesting.set(depth - 1);
        }
    }

    /// Saves and zeroes the nesting count, handing the saved value back to
    /// the caller. Used by the thread-level save/restore-around-yield
    /// pattern: each thread keeps its own nesting depth across a context
    /// switch instead of sharing the global counter with whatever runs
    /// next.
    pub fn take(&self) -> u32 {
        let depth = self.nesting.get();
        self.nesting.set(0);
        depth
    }

    /// Restores a nesting count previously returned by [`State::take`].
    pub fn restore(&self, depth: u32) {
        self.nesting.set(depth);
    }

    /// Implements the per-thread critical-nesting save/restore around a
    /// context switch: zero the nesting count and genuinely re-enable
    /// interrupts before calling `yield_fn`, then re-mask them and restore
    /// the saved nesting once the calling thread runs again. This is what
    /// lets each thread carry its own effective nesting depth across a
    /// switch instead of sharing the global counter with whatever runs
    /// next.
    ///
    /// # Safety
    /// Must be called with interrupts currently masked by this `State`
    /// (i.e. from inside a held [`Guard`]).
    pub unsafe fn around_yield<P: Port>(&self, yield_fn: impl FnOnce()) {
        let saved_nesting = self.take();
        P::enable_interrupts(self.saved_level.get());

        yield_fn();

        let level = P::disable_interrupts();
        self.saved_level.set(level);
        self.restore(saved_nesting);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard produced by [`enter`]. Interrupts stay masked for as long as
/// this (or any nested sibling) is alive.
pub struct Guard<'a, P: Port> {
    state: &'a State,
    _port: PhantomData<P>,
}

impl<'a, P: Port> Guard<'a, P> {
    pub fn state(&self) -> &'a State {
        self.state
    }
}

impl<'a, P: Port> Drop for Guard<'a, P> {
    fn drop(&mut self) {
        self.state.exit::<P>();
    }
}

/// Enters a critical section, returning a guard that exits it on drop.
pub fn enter<P: Port>(state: &State) -> Guard<'_, P> {
    state.enter::<P>();
    Guard {
        state,
        _port: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static DISABLE_CALLS: AtomicUsize = AtomicUsize::new(0);
    static ENABLE_CALLS: AtomicUsize = AtomicUsize::new(0);

    struct CountingPort;
    impl Port for CountingPort {
        fn disable_interrupts() -> usize {
            DISABLE_CALLS.fetch_add(1, Ordering::SeqCst);
            0
        }
        fn enable_interrupts(_previous_level: usize) {
            ENABLE_CALLS.fetch_add(1, Ordering::SeqCst);
        }
        fn interrupts_active() -> bool {
            true
        }
        unsafe fn make_initial_stack(
            _stack_base: *mut u8,
            _stack_size: usize,
            _entry: rtos_arch::ThreadEntry,
            _argument: usize,
            _return_hook: extern "C" fn() -> !,
        ) -> *mut u8 {
            core::ptr::null_mut()
        }
        fn start_kernel() -> ! {
            loop {}
        }
        unsafe fn yield_now(_current_sp: *mut *mut u8) {}
        fn idle() -> ! {
            loop {}
        }
    }

    #[test]
    fn nested_entries_mask_interrupts_once() {
        DISABLE_CALLS.store(0, Ordering::SeqCst);
        ENABLE_CALLS.store(0, Ordering::SeqCst);
        let state = State::new();

        let outer = enter::<CountingPort>(&state);
        assert_eq!(state.nesting(), 1);
        let inner = enter::<CountingPort>(&state);
        assert_eq!(state.nesting(), 2);
        drop(inner);
        assert_eq!(state.nesting(), 1);
        assert_eq!(ENABLE_CALLS.load(Ordering::SeqCst), 0);
        drop(outer);
        assert_eq!(state.nesting(), 0);

        assert_eq!(DISABLE_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(ENABLE_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn take_and_restore_round_trips() {
        let state = State::new();
        let _g = enter::<CountingPort>(&state);
        let _g2 = enter::<CountingPort>(&state);
        assert_eq!(state.nesting(), 2);

        let saved = state.take();
        assert_eq!(saved, 2);
        assert_eq!(state.nesting(), 0);

        state.restore(saved);
        assert_eq!(state.nesting(), 2);
    }

    #[test]
    fn around_yield_restores_nesting_and_remasks() {
        DISABLE_CALLS.store(0, Ordering::SeqCst);
        ENABLE_CALLS.store(0, Ordering::SeqCst);
        let state = State::new();
        let _outer = enter::<CountingPort>(&state);
        let _inner = enter::<CountingPort>(&state);
        assert_eq!(state.nesting(), 2);

        let mut ran = false;
        unsafe {
            state.around_yield::<CountingPort>(|| {
                assert_eq!(state.nesting(), 0);
                ran = true;
            });
        }
        assert!(ran);
        assert_eq!(state.nesting(), 2);
        assert_eq!(ENABLE_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(DISABLE_CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn isr_nesting_tracks_enter_exit() {
        let state = State::new();
        assert_eq!(state.irq_nesting(), 0);
        state.enter_isr();
        state.enter_isr();
        assert_eq!(state.irq_nesting(), 2);
        state.exit_isr();
        assert_eq!(state.irq_nesting(), 1);
        state.exit_isr();
        assert_eq!(state.irq_nesting(), 0);
    }
}
