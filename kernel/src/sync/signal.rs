//! Value-addressed wakeups: a sender picks out waiters by a matching `u32`
//! value and optionally copies a small payload to each one, leaving
//! non-matching waiters parked.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use rtos_arch::Port;
use rtos_infra::list::{self, ListNode};

use crate::critical;
use crate::sched::Kernel;
use crate::thread::Thread;

struct WaitDescriptor {
    value: u32,
    buffer: *mut u8,
    size: usize,
    result: Cell<bool>,
}

/// A signal: threads wait for a specific value, senders address by value.
pub struct Signal<P: Port> {
    waiters: ListNode,
    _port: PhantomData<fn() -> P>,
}

unsafe impl<P: Port> Send for Signal<P> {}
unsafe impl<P: Port> Sync for Signal<P> {}

impl<P: Port> Signal<P> {
    const fn new() -> Self {
        Self {
            waiters: ListNode::new(),
            _port: PhantomData,
        }
    }

    unsafe fn init(&mut self) {
        self.waiters.init();
    }

    fn waiters(&self) -> NonNull<ListNode> {
        NonNull::from(&self.waiters)
    }

    /// # Safety
    /// Must not be called from interrupt context.
    pub unsafe fn create(kernel: &'static Kernel<P>) -> Option<NonNull<Self>> {
        let _g = critical::enter::<P>(&kernel.critical);
        let mem = kernel
            .heap()
            .allocate(core::mem::size_of::<Self>(), kernel.kernel_memory())?;
        let ptr = mem.as_ptr() as *mut Self;
        core::ptr::write(ptr, Self::new());
        let mut signal = NonNull::new_unchecked(ptr);
        signal.as_mut().init();
        Some(signal)
    }

    /// Wakes every waiter (their descriptors stay `false`) and frees the
    /// control block.
    ///
    /// # Safety
    /// `signal` must be a live signal from [`Signal::create`], never used
    /// again after this call.
    pub unsafe fn delete(kernel: &'static Kernel<P>, signal: NonNull<Self>) {
        let _g = critical::enter::<P>(&kernel.critical);
        kernel.ready_all(signal.as_ref().waiters());
        kernel.reschedule();
        kernel
            .heap()
            .free(NonNull::new_unchecked(signal.as_ptr() as *mut u8));
    }

    /// Blocks until a matching [`Signal::send`] arrives or `timeout` ticks
    /// elapse (`0` = forever). If `buffer` is non-null and the sender
    /// provided a payload, up to `size` bytes are copied in.
    ///
    /// # Safety
    /// Must not be called from interrupt context. `buffer` (if non-null)
    /// must be valid for `size` writes for the duration of the call.
    /// `self` must be initialized.
    pub unsafe fn wait(&self, kernel: &'static Kernel<P>, value: u32, buffer: *mut u8, size: usize, timeout: u32) -> bool {
        let _g = critical::enter::<P>(&kernel.critical);
        let desc = WaitDescriptor {
            value,
            buffer,
            size,
            result: Cell::new(false),
        };
        kernel.block_current(Some(self.waiters()), timeout, &desc as *const _ as *mut ());
        desc.result.get()
    }

    /// Wakes every waiter currently parked on `value`, copying up to
    /// `min(size, waiter's buffer size)` bytes of `payload` into each if
    /// both sides provided a non-null, non-zero-length buffer.
    ///
    /// Walks the waiter list by hand rather than popping matches in a
    /// loop: a non-matching waiter must be skipped in place, and reading
    /// its successor has to happen before a match ahead of it is readied
    /// (which detaches that node and would otherwise invalidate the walk).
    ///
    /// # Safety
    /// `payload` (if non-null) must be valid for `size` reads. `self`
    /// must be initialized.
    pub unsafe fn send(&self, kernel: &'static Kernel<P>, value: u32, payload: *const u8, size: usize) {
        let _g = critical::enter::<P>(&kernel.critical);
        let head = self.waiters();
        let mut cursor = match head.as_ref().next() {
            Some(node) => node,
            None => return,
        };
        loop {
            let next = cursor.as_ref().next();
            let thread = Thread::from_scheduler_link(cursor);
            let desc = thread.as_ref().wait_descriptor.get() as *const WaitDescriptor;
            if (*desc).value == value {
                if !(*desc).buffer.is_null() && !payload.is_null() && size > 0 {
                    let len = size.min((*desc).size);
                    ptr::copy_nonoverlapping(payload, (*desc).buffer, len);
                }
                (*desc).result.set(true);
                kernel.ready_thread(thread);
            }
            match next {
                Some(node) if !ptr::eq(node.as_ptr(), head.as_ptr()) => cursor = node,
                _ => break,
            }
        }
        kernel.reschedule();
    }
}
